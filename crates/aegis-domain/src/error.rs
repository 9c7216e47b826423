//! Error types for the domain model

use thiserror::Error;

/// Errors raised while validating or converting domain objects
#[derive(Error, Debug)]
pub enum DomainError {
    /// A required field is missing or empty
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Timestamp is not RFC 3339 with an explicit offset
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A value is out of its allowed range
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Payload did not match the expected per-topic schema
    #[error("payload validation failed: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}
