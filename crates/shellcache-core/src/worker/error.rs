use thiserror::Error;

use super::WorkerState;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("Fetching {url} returned status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Invalid cache generation name: {0}")]
    InvalidGeneration(String),

    #[error("Cannot {operation} while worker is {state:?}")]
    InvalidState {
        state: WorkerState,
        operation: &'static str,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
