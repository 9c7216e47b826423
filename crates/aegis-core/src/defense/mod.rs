//! Defense sub-chain
//!
//! Isomorphic to the fix pipeline, with its own topics and idempotency
//! keys: detect (rule correlation over located events) -> assess (provider
//! chain) -> actuate (informational actions, `action_id`-keyed) -> verify
//! (indicator normalization over a fixed window). The whole chain is
//! informational; every emission carries the defense disclaimer and the
//! sandbox markers.

pub mod actuator;
pub mod assessor;
pub mod detector;
pub mod geo;
pub mod verifier;

pub use actuator::DefenseActuator;
pub use assessor::{DefenseAssessor, RuleAssessor, ThreatAssessor};
pub use detector::{DefenseDetector, DetectorThresholds};
pub use verifier::DefenseVerifier;
