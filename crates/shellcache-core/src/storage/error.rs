use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage is not available")]
    Unavailable,

    #[error("Storage quota exceeded: need {needed} bytes, {remaining} remaining")]
    QuotaExceeded { needed: usize, remaining: usize },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt value under key {0}")]
    Corrupt(String),
}
