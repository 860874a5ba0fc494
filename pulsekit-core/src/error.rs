//! Error types for pulsekit-core

use thiserror::Error;

/// Main error type for the pulsekit-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Delivery to the collection endpoint failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Input rejected before it reached the queue
    #[error("validation error: {0}")]
    Validation(String),

    /// A persisted request breaks the GET/POST payload invariant
    #[error("malformed request record {id}: {reason}")]
    MalformedRecord { id: i64, reason: String },

    /// User picture URL does not point at a supported image
    #[error("invalid picture url: {0}")]
    InvalidPictureUrl(String),

    /// Schema migration failed; the version marker was left untouched
    #[error("migration to version {version} failed: {message}")]
    Migration { version: i32, message: String },
}

/// Result type alias for pulsekit-core
pub type Result<T> = std::result::Result<T, Error>;
