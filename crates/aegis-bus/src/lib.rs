//! Pub/sub bus abstraction for the Aegis pipeline.
//!
//! One backend is active per process, selected once at startup via
//! [`config::create_bus`]. Backends provide at-least-once delivery with
//! per-topic FIFO best effort; nothing here assumes total order across
//! topics or exactly-once delivery - handlers are written to be idempotent.
//!
//! Dispatch contract: messages on a single subscription are handled
//! **serially** by that subscription's dispatcher task. Distinct
//! subscriptions run concurrently with respect to each other.

pub mod config;
pub mod error;
pub mod memory;
pub mod nats;
pub mod retry;
pub mod traits;

pub use config::{create_bus, BusBackendKind};
pub use error::BusError;
pub use memory::MemoryBus;
pub use nats::NatsBus;
pub use retry::RetryPolicy;
pub use traits::{handler_fn, EventHandler, MessageBus};

/// Result type for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;
