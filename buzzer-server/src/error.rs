//! Server error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}
