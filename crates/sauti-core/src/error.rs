//! Error types for the Sauti streaming engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Client error ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("Audio sink error: {0}")]
    Audio(String),

    #[error("Ring buffer error: {0}")]
    Buffer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Circuit breaker open for target: {0}")]
    CircuitOpen(String),

    #[error("Streaming daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<hound::Error> for Error {
    fn from(e: hound::Error) -> Self {
        Error::Audio(e.to_string())
    }
}
