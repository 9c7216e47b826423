//! Engine harness
//!
//! Builds every agent from a config plus injected bus/stores, wires
//! subscriptions, runs startup reconciliation, and shuts the whole process
//! down cooperatively with a bounded drain.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use aegis_bus::MessageBus;
use aegis_state::{DeploymentStore, EventStore, VerificationStore};

use crate::actuator::Actuator;
use crate::autonomy::{AutonomyHandle, AutonomyRouter};
use crate::config::EngineConfig;
use crate::defense::{DefenseActuator, DefenseAssessor, DefenseDetector, DefenseVerifier, DetectorThresholds};
use crate::gate::ApprovalGate;
use crate::logger::EventLogger;
use crate::planner::PlannerChain;
use crate::proposer::FixProposer;
use crate::telemetry::COUNTERS;
use crate::verifier::Verifier;

/// The stores an engine runs against; split by owning component.
pub struct EngineStores {
    pub events: Arc<dyn EventStore>,
    pub fix_deployments: Arc<dyn DeploymentStore>,
    pub fix_verifications: Arc<dyn VerificationStore>,
    pub defense_deployments: Arc<dyn DeploymentStore>,
    pub defense_verifications: Arc<dyn VerificationStore>,
}

/// A fully wired engine. Dropping it does not stop the agents; call
/// [`Engine::shutdown`] for a clean stop.
pub struct Engine {
    bus: Arc<dyn MessageBus>,
    pub autonomy: AutonomyHandle,
    pub proposer: Arc<FixProposer>,
    pub router: Arc<AutonomyRouter>,
    pub gate: Arc<ApprovalGate>,
    pub actuator: Arc<Actuator>,
    pub verifier: Arc<Verifier>,
    pub logger: Arc<EventLogger>,
    pub defense_detector: Arc<DefenseDetector>,
    pub defense_assessor: Arc<DefenseAssessor>,
    pub defense_actuator: Arc<DefenseActuator>,
    pub defense_verifier: Arc<DefenseVerifier>,
}

impl Engine {
    /// Construct and wire every agent, then reconcile pending work.
    pub async fn start(
        config: &EngineConfig,
        bus: Arc<dyn MessageBus>,
        stores: EngineStores,
    ) -> crate::Result<Engine> {
        let autonomy = AutonomyHandle::new(config.autonomy_initial);

        let logger = EventLogger::new(bus.clone(), stores.events.clone());
        logger.wire().await?;

        let planners = PlannerChain::from_config(&config.llm, config.verification_window_secs);
        let proposer = FixProposer::new(
            bus.clone(),
            autonomy.clone(),
            planners,
            config.processed_cache_capacity,
        );
        proposer.wire().await?;

        let router = AutonomyRouter::new(bus.clone(), autonomy.clone());
        router.wire().await?;

        let gate = ApprovalGate::new(bus.clone(), stores.events.clone());
        gate.wire().await?;

        let actuator = Actuator::new(bus.clone(), stores.fix_deployments.clone());
        actuator.wire().await?;

        let verifier = Verifier::new(
            bus.clone(),
            stores.events.clone(),
            stores.fix_verifications.clone(),
            config.baseline_factors,
        );
        verifier.wire().await?;
        verifier.resume_pending().await?;

        let thresholds = DetectorThresholds {
            dedup_window_secs: config.dedup_window_secs as i64,
            dedup_radius_km: config.dedup_radius_km,
            ..Default::default()
        };
        let defense_detector = DefenseDetector::new(bus.clone(), thresholds);
        defense_detector.wire().await?;

        let defense_assessor = DefenseAssessor::new(
            bus.clone(),
            &config.llm,
            config.processed_cache_capacity,
        );
        defense_assessor.wire().await?;

        let defense_actuator = DefenseActuator::new(
            bus.clone(),
            stores.defense_deployments.clone(),
            autonomy.clone(),
        );
        defense_actuator.wire().await?;

        let defense_verifier = DefenseVerifier::new(
            bus.clone(),
            stores.events.clone(),
            stores.defense_verifications.clone(),
            config.defense_window_secs,
        );
        defense_verifier.wire().await?;
        defense_verifier.resume_pending().await?;

        info!("engine started, all agents wired");
        Ok(Engine {
            bus,
            autonomy,
            proposer,
            router,
            gate,
            actuator,
            verifier,
            logger,
            defense_detector,
            defense_assessor,
            defense_actuator,
            defense_verifier,
        })
    }

    /// Cooperative shutdown: stop accepting messages, give in-flight
    /// publishes a bounded grace period, emit final counters.
    pub async fn shutdown(&self, grace: Duration) {
        info!("engine shutting down");
        tokio::time::sleep(grace).await;
        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "bus close failed");
        }
        COUNTERS.flush();
        info!("engine stopped");
    }
}
