//! Error types for fieldgate-core

use thiserror::Error;

/// Main error type for the fieldgate-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Outbox storage error
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Outbox reached its configured capacity; new records are rejected
    #[error("outbox is full ({capacity} records pending)")]
    OutboxFull { capacity: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A single publish attempt failed (timeout, rejection, link down)
    #[error("publish failed: {0}")]
    Publish(String),

    /// Connectivity probe failed or timed out
    #[error("connectivity probe failed: {0}")]
    Probe(String),

    /// Producer handed over an observation that cannot be relayed
    #[error("malformed observation: {0}")]
    MalformedObservation(String),

    /// Relay intake channel closed
    #[error("relay intake is closed")]
    IntakeClosed,
}

impl Error {
    /// True for outbox persistence failures, which must be surfaced to the operator
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::OutboxFull { .. })
    }
}

/// Result type alias for fieldgate-core
pub type Result<T> = std::result::Result<T, Error>;
