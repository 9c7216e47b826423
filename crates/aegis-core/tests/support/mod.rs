//! Shared fixtures for the end-to-end suites: an in-memory engine and a
//! recording probe for asserting on bus traffic.
#![allow(dead_code)] // each test binary uses a different subset

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;

use aegis_bus::{BusBackendKind, EventHandler, MemoryBus, MessageBus};
use aegis_core::config::{EngineConfig, LlmConfig};
use aegis_core::harness::{Engine, EngineStores};
use aegis_core::metrics::BaselineFactors;
use aegis_core::AutonomyLevel;
use aegis_domain::fix::{
    ActionTarget, ActionType, ActionVerification, ExpectedImpact, FixAction, FixDetails, FixSource,
    RiskLevel,
};
use aegis_domain::Envelope;
use aegis_state::fakes::{MemoryDeploymentStore, MemoryEventStore, MemoryVerificationStore};

/// Records every envelope seen on its subscriptions.
pub struct Probe {
    seen: Mutex<Vec<(String, Envelope)>>,
}

#[async_trait]
impl EventHandler for Probe {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        self.seen
            .lock()
            .unwrap()
            .push((topic.to_string(), envelope));
    }
}

impl Probe {
    /// Subscribe a fresh probe to the given topics.
    pub async fn attach(bus: &Arc<MemoryBus>, topics: &[&str]) -> Arc<Probe> {
        let probe = Arc::new(Probe {
            seen: Mutex::new(Vec::new()),
        });
        for topic in topics {
            bus.subscribe(topic, probe.clone()).await.unwrap();
        }
        probe
    }

    pub fn all(&self, topic: &str) -> Vec<Envelope> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.all(topic).len()
    }

    /// Wait until at least one envelope arrived on `topic`, panicking on
    /// timeout with a dump of what was seen instead.
    pub async fn wait_for(&self, topic: &str, timeout: Duration) -> Envelope {
        self.wait_for_nth(topic, 1, timeout).await
    }

    /// Wait until at least `n` envelopes arrived on `topic`, returning the
    /// nth (1-based).
    pub async fn wait_for_nth(&self, topic: &str, n: usize, timeout: Duration) -> Envelope {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let matched = self.all(topic);
            if matched.len() >= n {
                return matched.into_iter().nth(n - 1).unwrap();
            }
            if tokio::time::Instant::now() >= deadline {
                let seen: Vec<String> = self
                    .seen
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(t, _)| t.clone())
                    .collect();
                panic!("timed out waiting for {n} event(s) on {topic}; saw {seen:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Let in-flight dispatchers settle before counting.
    pub async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// A wired engine over the in-memory bus and stores, with direct store
/// access for record assertions.
pub struct TestEngine {
    pub engine: Engine,
    pub bus: Arc<MemoryBus>,
    pub events: Arc<MemoryEventStore>,
    pub fix_deployments: Arc<MemoryDeploymentStore>,
    pub fix_verifications: Arc<MemoryVerificationStore>,
    pub defense_deployments: Arc<MemoryDeploymentStore>,
    pub defense_verifications: Arc<MemoryVerificationStore>,
}

pub async fn start_engine(
    verification_window_secs: u64,
    defense_window_secs: u64,
    autonomy_initial: AutonomyLevel,
) -> TestEngine {
    let config = EngineConfig {
        bus_backend: BusBackendKind::Memory,
        nats_url: String::new(),
        store_url: "mem://".to_string(),
        llm: LlmConfig::default(),
        autonomy_initial,
        verification_window_secs,
        defense_window_secs,
        dedup_window_secs: 300,
        dedup_radius_km: 5.0,
        processed_cache_capacity: NonZeroUsize::new(1024).unwrap(),
        baseline_factors: BaselineFactors::default(),
    };

    let bus = Arc::new(MemoryBus::new());
    let events = Arc::new(MemoryEventStore::new());
    let fix_deployments = Arc::new(MemoryDeploymentStore::new());
    let fix_verifications = Arc::new(MemoryVerificationStore::new());
    let defense_deployments = Arc::new(MemoryDeploymentStore::new());
    let defense_verifications = Arc::new(MemoryVerificationStore::new());

    let stores = EngineStores {
        events: events.clone(),
        fix_deployments: fix_deployments.clone(),
        fix_verifications: fix_verifications.clone(),
        defense_deployments: defense_deployments.clone(),
        defense_verifications: defense_verifications.clone(),
    };

    let engine = Engine::start(&config, bus.clone(), stores).await.unwrap();

    TestEngine {
        engine,
        bus,
        events,
        fix_deployments,
        fix_verifications,
        defense_deployments,
        defense_verifications,
    }
}

/// A fix with a single action, for driving the actuator directly.
pub fn fix_with_action(action: FixAction) -> FixDetails {
    FixDetails {
        fix_id: FixDetails::mint_id(Utc::now()),
        correlation_id: "INC-TEST".to_string(),
        source: FixSource::Rules,
        title: "test fix".to_string(),
        summary: "test fix summary".to_string(),
        actions: vec![action],
        risk_level: RiskLevel::Med,
        expected_impact: ExpectedImpact::default(),
        created_at: Utc::now(),
        proposed_by: "test".to_string(),
        requires_human_approval: false,
        review_notes: None,
        approved_by: Some("test".to_string()),
        deployed_at: None,
        verified_at: None,
        rollback_reason: None,
        extra: Map::new(),
    }
}

pub fn transit_action(route_id: &str, threshold: f64, window_seconds: u64) -> FixAction {
    FixAction {
        action_type: ActionType::TransitRerouteSim,
        target: ActionTarget {
            route_id: Some(route_id.to_string()),
            ..Default::default()
        },
        params: Map::new(),
        verification: Some(ActionVerification {
            metric_name: "delay_reduction".to_string(),
            threshold,
            window_seconds,
        }),
    }
}

pub fn power_action(sector: &str, window_seconds: u64) -> FixAction {
    FixAction {
        action_type: ActionType::PowerRecoverySim,
        target: ActionTarget {
            sector_id: Some(sector.to_string()),
            ..Default::default()
        },
        params: Map::new(),
        verification: Some(ActionVerification {
            metric_name: "voltage_stable".to_string(),
            threshold: 1.0,
            window_seconds,
        }),
    }
}
