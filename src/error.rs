use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("config parse error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] zero_mysql::error::Error),

    #[error("database pool exhausted")]
    PoolExhausted,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
