// error.rs
// ============================================================================
// Note:     Library error type covering data loading, configuration,
//           checkpoints and scan control flow.
// ============================================================================

use thiserror::Error;

/// Main error type for the classifier pipeline
#[derive(Error, Debug)]
pub enum CnnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Scan cancelled after {completed} rounds")]
    Cancelled { completed: usize },
}

impl From<bincode::error::EncodeError> for CnnError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CnnError::Checkpoint(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CnnError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CnnError::Checkpoint(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CnnError>;
