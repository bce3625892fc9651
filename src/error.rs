//! Error types for the adapter pipeline.

use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Storage drive is locked by another process")]
    Locked,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Adapter chain is shut down")]
    Closed,
}

impl From<serde_json::Error> for AdapterError {
    fn from(e: serde_json::Error) -> Self {
        AdapterError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for AdapterError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        AdapterError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for AdapterError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        AdapterError::Deserialization(e.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, AdapterError>;
