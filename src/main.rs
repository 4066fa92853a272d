use std::process::ExitCode;

use evhttpd::config::Config;
use evhttpd::server::Server;

fn config_path() -> String {
    std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string())
}

fn main() -> ExitCode {
    let path = config_path();
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    proxy_log::init(
        config.log.level(),
        config.log.directory.clone(),
        &config.log.suffix,
        config.log.queue_size,
    );

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            proxy_log::error!("failed to start server: {e}");
            proxy_log::shutdown();
            return ExitCode::FAILURE;
        }
    };

    let result = server.run();
    if let Err(e) = result {
        proxy_log::error!("server loop exited: {e}");
        proxy_log::shutdown();
        return ExitCode::FAILURE;
    }

    proxy_log::shutdown();
    ExitCode::SUCCESS
}
