//! State persistence for the Aegis pipeline (Layer 0).
//!
//! Three storage abstractions, all async and backend-agnostic:
//! - [`store_traits::EventStore`]: append-only log of every bus message,
//!   queryable by topic and time window
//! - [`store_traits::DeploymentStore`]: keyed deployment records; its
//!   `begin` operation is the atomic check-then-set the actuator's
//!   idempotency rests on
//! - [`store_traits::VerificationStore`]: keyed verification records with
//!   append-only timelines
//!
//! In-memory fakes live in [`fakes`]; the SurrealDB backend in [`surreal`].

pub mod error;
pub mod fakes;
pub mod records;
pub mod store_traits;
pub mod surreal;

pub use error::StateError;
pub use records::{
    DeploymentRecord, DeploymentStatus, TimelineEntry, VerificationRecord, VerificationStatus,
};
pub use store_traits::{
    BeginOutcome, DeploymentStore, EventQuery, EventStore, StoredEvent, VerificationStore,
};

/// Result type for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;
