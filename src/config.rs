//! Startup configuration, loaded once at process start and handed to
//! `Server::new`. The core never re-reads it afterwards.
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Lt,
    Et,
}

impl Trigger {
    pub fn is_edge_triggered(self) -> bool {
        matches!(self, Trigger::Et)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub server_name: String,
    pub root: String,
    #[serde(default)]
    pub default_server: bool,
    #[serde(default)]
    pub error_pages: HashMap<u16, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    pub pool_size: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "./log".to_string()
}

fn default_log_suffix() -> String {
    ".log".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub directory: String,
    #[serde(default = "default_log_suffix")]
    pub suffix: String,
    #[serde(default)]
    pub queue_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            directory: default_log_dir(),
            suffix: default_log_suffix(),
            queue_size: 1024,
        }
    }
}

impl LogConfig {
    pub fn level(&self) -> proxy_log::Level {
        match self.level.as_str() {
            "debug" => proxy_log::Level::Debug,
            "warn" => proxy_log::Level::Warn,
            "error" => proxy_log::Level::Error,
            _ => proxy_log::Level::Info,
        }
    }
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_worker_count() -> usize {
    8
}

fn default_trigger_lt() -> Trigger {
    Trigger::Lt
}

fn default_trigger_et() -> Trigger {
    Trigger::Et
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub linger_on_close: bool,
    #[serde(default = "default_trigger_lt")]
    pub listener_trigger: Trigger,
    #[serde(default = "default_trigger_et")]
    pub connection_trigger: Trigger,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    pub db: Option<DbConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn from_str(contents: &str) -> Result<Config> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let contents = fs::read_to_string(path)?;
        Config::from_str(&contents)
    }

    /// Resolve the `ServerConfig` to use for a `Host:` header value on a
    /// listener bound at `port`, falling back to the first config marked
    /// `default_server`, then the first config for that port at all.
    pub fn resolve<'a>(&'a self, port: u16, host_header: &str) -> Option<&'a ServerConfig> {
        let host_only = host_header.split(':').next().unwrap_or(host_header);
        let candidates: Vec<&ServerConfig> = self
            .servers
            .iter()
            .filter(|s| s.ports.contains(&port))
            .collect();
        candidates
            .iter()
            .find(|s| s.server_name == host_only)
            .or_else(|| candidates.iter().find(|s| s.default_server))
            .or_else(|| candidates.first())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
servers:
  - host: 0.0.0.0
    ports: [8080]
    server_name: default
    root: ./www
    default_server: true
worker_count: 4
"#;

    #[test]
    fn parses_minimal_config() {
        let config = Config::from_str(SAMPLE).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].host, "0.0.0.0");
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.connection_trigger, Trigger::Et);
    }

    #[test]
    fn resolve_prefers_matching_server_name() {
        let yaml = r#"
servers:
  - host: 0.0.0.0
    ports: [8080]
    server_name: a.example
    root: ./a
  - host: 0.0.0.0
    ports: [8080]
    server_name: b.example
    root: ./b
    default_server: true
"#;
        let config = Config::from_str(yaml).unwrap();
        let resolved = config.resolve(8080, "a.example:8080").unwrap();
        assert_eq!(resolved.server_name, "a.example");
        let fallback = config.resolve(8080, "unknown.example").unwrap();
        assert_eq!(fallback.server_name, "b.example");
    }
}
