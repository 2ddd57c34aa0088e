//! Error types for devtrack-core

use thiserror::Error;

/// Main error type for the devtrack-core library
///
/// Delivery failures are never represented here: the transport classifies
/// them and the delivery client absorbs them into the retry queue. What
/// remains are failures the caller has to act on.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// On-disk queue is unreadable or inconsistent
    #[error("queue corrupted: {0}")]
    QueueCorrupt(String),

    /// HTTP client could not be constructed
    #[error("transport error: {0}")]
    Transport(String),

    /// Logging could not be initialized
    #[error("logging error: {0}")]
    Logging(String),

    /// Device enumeration failed
    #[error("device error: {0}")]
    Device(String),
}

/// Result type alias for devtrack-core
pub type Result<T> = std::result::Result<T, Error>;
