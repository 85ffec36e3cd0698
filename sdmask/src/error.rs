use thiserror::Error;

/// Result type for mask orchestration
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid line window: {0}")]
    InvalidWindow(String),

    #[error("Invalid window mode '{0}', expected 'replace' or 'merge'")]
    InvalidWindowMode(String),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] sdcore::Error),
}
