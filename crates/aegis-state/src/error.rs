//! Error types for the state layer

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error (transient; retry with backoff)
    #[error("store connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("store query failed: {0}")]
    Query(String),

    /// Record not found for the given key
    #[error("record not found: {key}")]
    NotFound { key: String },

    /// Record is not in a valid state for the requested operation
    #[error("record {key} is {status}, expected {expected}")]
    InvalidRecordState {
        key: String,
        status: String,
        expected: String,
    },

    /// Schema setup error
    #[error("schema setup failed: {0}")]
    SchemaSetup(String),

    /// Serialization/deserialization error
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StateError {
    /// Whether the operation may succeed on retry (store reachability
    /// problems, not logic errors).
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::Connection(_) | StateError::Query(_))
    }
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}
