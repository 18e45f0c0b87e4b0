//! Error types for the relay.

use crate::types::EventId;
use thiserror::Error;

/// Error returned by a processing call.
pub type ProcessError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Storage directory is locked by another process")]
    Locked,

    #[error("Invalid log key: {0}")]
    InvalidKey(String),

    #[error("Undecodable event {id}: {message}")]
    UndecodableEvent { id: EventId, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown processing call: {0}")]
    UnknownCall(String),

    #[error("Processing call `{call}` failed: {message}")]
    Processing { call: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Replication stream error: {0}")]
    Stream(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for RelayError {
    fn from(e: serde_yaml::Error) -> Self {
        RelayError::Config(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RelayError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RelayError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RelayError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RelayError::Deserialization(e.to_string())
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
