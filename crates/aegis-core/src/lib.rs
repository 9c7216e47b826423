//! Aegis Core Library
//!
//! The fix lifecycle engine and the defense sub-chain: every long-running
//! agent, the planner providers, metric semantics, and the wiring harness.
//! Components receive the bus, the stores, and the autonomy handle at
//! construction - no process-wide singletons - so tests inject the
//! in-memory fakes from `aegis-bus` and `aegis-state`.

pub mod actuator;
pub mod autonomy;
pub mod config;
pub mod defense;
pub mod error;
pub mod gate;
pub mod harness;
pub mod logger;
pub mod metrics;
pub mod planner;
pub mod proposer;
pub mod schedule;
pub mod telemetry;
pub mod verifier;

pub use autonomy::{AutonomyHandle, AutonomyLevel, AutonomyRouter};
pub use config::EngineConfig;
pub use error::EngineError;
pub use harness::Engine;
pub use telemetry::{init_tracing, COUNTERS};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
