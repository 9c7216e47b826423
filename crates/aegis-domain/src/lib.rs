//! Domain model for the Aegis crisis-management event pipeline.
//!
//! Everything that crosses the bus is an [`envelope::Envelope`]; the typed
//! views in [`fix`] and [`threat`] parse the envelope's `details` payload at
//! the edges so that components work with structured data internally while
//! unknown fields survive pass-through untouched.

pub mod envelope;
pub mod error;
pub mod fix;
pub mod threat;
pub mod topics;

pub use envelope::{Envelope, EventId, Severity};
pub use error::DomainError;

/// Result type for domain operations
pub type Result<T> = std::result::Result<T, DomainError>;
