use thiserror::Error;

#[derive(Error, Debug)]
pub enum GradSyncError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rejected parameter combination, raised before any collective runs.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("Communication error: {0}")]
    Communication(String),
}

pub type Result<T> = std::result::Result<T, GradSyncError>;
