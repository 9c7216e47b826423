//! Defense actuator
//!
//! Executes approved informational actions: alert-level change, public
//! advisory, monitoring-rate bump, autonomy lock. Idempotent on
//! `action_id` via the defense deployment store; like the fix actuator,
//! action handlers return the events to publish and every payload passes
//! through the sandbox markers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::envelope::mark_sandboxed;
use aegis_domain::threat::{DefenseActionDetails, DefenseActionType};
use aegis_domain::{topics, Envelope, Severity};

use aegis_state::{BeginOutcome, DeploymentStore};

use crate::autonomy::{AutonomyHandle, AutonomyLevel};
use crate::telemetry::COUNTERS;

/// Executes informational defense actions in the sandbox.
pub struct DefenseActuator {
    bus: Arc<dyn MessageBus>,
    deployments: Arc<dyn DeploymentStore>,
    autonomy: AutonomyHandle,
    source_id: String,
}

impl DefenseActuator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        deployments: Arc<dyn DeploymentStore>,
        autonomy: AutonomyHandle,
    ) -> Arc<Self> {
        Arc::new(DefenseActuator {
            bus,
            deployments,
            autonomy,
            source_id: "defense-actuator".to_string(),
        })
    }

    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        self.bus
            .subscribe(topics::DEFENSE_ACTION_APPROVED, self.clone())
            .await?;
        Ok(())
    }

    /// Build the sandbox emission for one action type. Returns the event to
    /// publish plus the result record.
    fn execute(&self, action: &DefenseActionDetails, sector: &str) -> (Envelope, Value) {
        let (summary, extra) = match action.action_type {
            DefenseActionType::RaiseAlertLevel => (
                format!("Alert level raised for threat {}", action.threat_id),
                json!({"alert_level": "elevated"}),
            ),
            DefenseActionType::PublicAdvisory => (
                format!("Public advisory issued for threat {}", action.threat_id),
                json!({"advisory": format!("Exercise caution in {sector}; situation under review")}),
            ),
            DefenseActionType::MonitoringBoost => (
                format!("Monitoring rate increased for threat {}", action.threat_id),
                json!({"monitoring_interval_secs": 10}),
            ),
            DefenseActionType::AutonomyLock => (
                format!("Autonomy locked to NORMAL for threat {}", action.threat_id),
                json!({"autonomy_level": AutonomyLevel::Normal.as_str()}),
            ),
        };

        let mut details = json!({
            "action_id": action.action_id,
            "threat_id": action.threat_id,
            "action_type": action.action_type.as_str(),
            "executor": self.source_id,
            "disclaimer": action.disclaimer,
        });
        if let (Some(map), Some(extra_map)) = (details.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                map.insert(key.clone(), value.clone());
            }
        }
        mark_sandboxed(&mut details);

        let envelope = Envelope::new(&self.source_id, Severity::Warning, sector, summary)
            .with_correlation(&action.threat_id)
            .with_details(details);
        let result = json!({
            "success": true,
            "action": action.action_type.as_str(),
            "action_id": action.action_id,
        });
        (envelope, result)
    }

    async fn on_action_approved(&self, envelope: &Envelope) -> crate::Result<()> {
        let action = DefenseActionDetails::from_value(&envelope.details)?;
        let sector = envelope.sector_id.clone();

        match self
            .deployments
            .begin(&action.action_id, envelope.details.clone())
            .await?
        {
            BeginOutcome::AlreadyActive(status) => {
                warn!(action_id = %action.action_id, status = %status, "action already deployed, skipping");
                return Ok(());
            }
            BeginOutcome::Fresh | BeginOutcome::Retry => {}
        }

        info!(action_id = %action.action_id, action = %action.action_type, "deploying defense action");
        let (simulation, result) = self.execute(&action, &sector);
        debug_assert!(simulation.is_sandboxed());
        self.bus.publish(topics::SYSTEM_ACTION, &simulation).await?;

        // The lock actually takes effect process-locally too.
        if action.action_type == DefenseActionType::AutonomyLock {
            self.autonomy.set_level(AutonomyLevel::Normal);
            info!("autonomy level forced to NORMAL");
        }

        let mut deployed_details = envelope.details.clone();
        if let Some(map) = deployed_details.as_object_mut() {
            map.insert(
                "deployed_at".to_string(),
                json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
            map.insert("deployed_by".to_string(), json!(self.source_id));
        }
        mark_sandboxed(&mut deployed_details);

        let deployed = Envelope::new(
            &self.source_id,
            Severity::Info,
            &sector,
            format!("Defense action {} deployed", action.action_id),
        )
        .with_correlation(&action.threat_id)
        .with_details(deployed_details);
        self.bus
            .publish(topics::DEFENSE_ACTION_DEPLOYED, &deployed)
            .await?;

        self.deployments
            .complete(&action.action_id, vec![result])
            .await?;
        COUNTERS.inc_deployments_executed();
        info!(action_id = %action.action_id, "defense action deployed");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for DefenseActuator {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        if let Err(e) = self.on_action_approved(&envelope).await {
            if e.is_transient() {
                warn!(topic, error = %e, "defense deployment refused, store unreachable");
            } else {
                warn!(topic, error = %e, "defense actuator handler failed");
            }
        }
    }
}
