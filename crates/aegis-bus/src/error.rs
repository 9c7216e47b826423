//! Error types for the bus layer

use thiserror::Error;

/// Errors that can occur while talking to the message bus
#[derive(Error, Debug)]
pub enum BusError {
    /// Connection could not be established within the retry budget
    #[error("bus connection failed: {0}")]
    Connect(String),

    /// The bus is currently disconnected; the operation is retriable
    #[error("bus disconnected: {0}")]
    Disconnected(String),

    /// Publish failed after the connection was established
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribe failed
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Payload could not be encoded for the wire
    #[error("payload encoding failed: {0}")]
    Encode(#[from] aegis_domain::DomainError),

    /// Unknown backend name in configuration
    #[error("unknown bus backend: {0} (supported: nats, memory)")]
    UnknownBackend(String),
}

impl BusError {
    /// Whether the caller may retry the operation after a delay.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BusError::Disconnected(_) | BusError::Publish { .. })
    }
}
