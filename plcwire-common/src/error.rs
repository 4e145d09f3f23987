use thiserror::Error;

pub type CommonResult<T> = Result<T, CommonError>;

#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("Failed to install logger: {0}")]
    Logger(String),
}
