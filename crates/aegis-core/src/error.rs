//! Engine error taxonomy
//!
//! Handlers never let these escape to the bus dispatcher: transient kinds
//! are retried locally, payload problems are logged and dropped, invariant
//! violations end the affected lifecycle with an explicit `*.failed` event,
//! and configuration problems abort startup.

use thiserror::Error;

use aegis_bus::BusError;
use aegis_domain::DomainError;
use aegis_state::StateError;

/// Errors raised inside engine components
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bus failure (retriable if the underlying error is)
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Event store / record store failure
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Payload failed schema validation - log, drop, record
    #[error("bad payload: {0}")]
    BadPayload(#[from] DomainError),

    /// All planner providers failed
    #[error("planner failed: {0}")]
    Planner(String),

    /// Business invariant violated (e.g. unknown action type) - surfaces as
    /// an explicit `*.failed` event, never as a crash
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Misconfiguration at boot - fatal, exit non-zero
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether retrying locally may help.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Bus(e) => e.is_retriable(),
            EngineError::State(e) => e.is_transient(),
            _ => false,
        }
    }
}
