//! Error types for metastore.

use thiserror::Error;

/// Result type alias using metastore's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for metastore operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Inbound bus message failed structural validation or decoding
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Compliance propagation was interrupted and must be retried via redelivery
    #[error("Compliance update stopped: {0}")]
    ComplianceUpdateStopped(String),

    /// Legal service responded with an error
    #[error("Legal service error: {0}")]
    LegalService(String),

    /// Message transport failed to publish, subscribe, or provision
    #[error("Transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request could not be sent or its response could not be read
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
