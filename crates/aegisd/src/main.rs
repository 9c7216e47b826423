//! Aegis daemon
//!
//! Boots the full engine from environment configuration and runs until
//! interrupted. Exit code 0 means clean shutdown; any startup failure
//! (unreachable bus or store, misconfiguration) exits non-zero before the
//! engine touches anything.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, Level};

use aegis_bus::{create_bus, RetryPolicy};
use aegis_core::harness::{Engine, EngineStores};
use aegis_core::EngineConfig;
use aegis_state::surreal::{self, SurrealDeploymentStore, SurrealEventStore, SurrealVerificationStore};

/// Grace period for in-flight publishes during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    aegis_core::init_tracing(false, Level::INFO);

    let config = EngineConfig::from_env().context("configuration")?;
    info!(backend = ?config.bus_backend, store = %config.store_url, "aegisd starting");

    let db = surreal::connect(&config.store_url)
        .await
        .context("event store unreachable")?;
    let stores = EngineStores {
        events: Arc::new(SurrealEventStore::new(db.clone())),
        fix_deployments: Arc::new(SurrealDeploymentStore::fix(db.clone())),
        fix_verifications: Arc::new(SurrealVerificationStore::fix(db.clone())),
        defense_deployments: Arc::new(SurrealDeploymentStore::defense(db.clone())),
        defense_verifications: Arc::new(SurrealVerificationStore::defense(db)),
    };

    let bus = create_bus(config.bus_backend, &config.nats_url, RetryPolicy::default())
        .await
        .context("bus unreachable")?;

    let engine = Engine::start(&config, bus, stores)
        .await
        .context("engine startup")?;

    info!("aegisd running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    engine.shutdown(SHUTDOWN_GRACE).await;
    info!("aegisd stopped");
    Ok(())
}
