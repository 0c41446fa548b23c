// src/error.rs
//! Error types for the location feed

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GpsError>;

#[derive(Debug, Error)]
pub enum GpsError {
    /// Socket connect/read/write failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected gpsd object, or a command that was never acknowledged
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unparsable address or settings value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation needs a current location but none has been set yet
    #[error("No active location: jump to a location or wait for a fix first")]
    NoActiveLocation,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
