//! Centralised tracing initialisation and lightweight counters.
//!
//! Call [`init_tracing`] once at program start to configure the global
//! subscriber with an `EnvFilter` and optional JSON formatting.
//!
//! Safe to call more than once - subsequent calls are silently ignored
//! (the global subscriber can only be set once per process).

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json` - when `true`, emit newline-delimited JSON log lines.
/// * `level` - default verbosity when `RUST_LOG` is not set.
///
/// Respects the `RUST_LOG` environment variable for fine-grained filtering.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}

/// Global pipeline counters.
pub static COUNTERS: Counters = Counters::new();

/// Atomic counters for the pipeline's key transitions - no allocations, no
/// locking. Call [`Counters::flush`] at natural boundaries (shutdown, daemon
/// tick) to emit current values as one `info!` event.
pub struct Counters {
    events_logged: AtomicU64,
    fixes_proposed: AtomicU64,
    deployments_executed: AtomicU64,
    verifications_completed: AtomicU64,
    threats_detected: AtomicU64,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            events_logged: AtomicU64::new(0),
            fixes_proposed: AtomicU64::new(0),
            deployments_executed: AtomicU64::new(0),
            verifications_completed: AtomicU64::new(0),
            threats_detected: AtomicU64::new(0),
        }
    }

    pub fn inc_events_logged(&self) {
        self.events_logged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fixes_proposed(&self) {
        self.fixes_proposed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deployments_executed(&self) {
        self.deployments_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_verifications_completed(&self) {
        self.verifications_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_threats_detected(&self) {
        self.threats_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            events_logged = self.events_logged.load(Ordering::Relaxed),
            fixes_proposed = self.fixes_proposed.load(Ordering::Relaxed),
            deployments_executed = self.deployments_executed.load(Ordering::Relaxed),
            verifications_completed = self.verifications_completed.load(Ordering::Relaxed),
            threats_detected = self.threats_detected.load(Ordering::Relaxed),
            "pipeline counters"
        );
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}
