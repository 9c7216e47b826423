//! Fix actuator - the transactional heart of the pipeline
//!
//! Consumes `fix.deploy_requested`, executes each action in its sandbox,
//! and reports the aggregate as `fix.deploy_succeeded` or
//! `fix.deploy_failed`. Idempotency rests on the deployment store's atomic
//! `begin`: the second arrival of a request for an active or succeeded
//! `fix_id` is a logged no-op, a failed one restarts.
//!
//! Sandbox enforcement happens at the type boundary: action handlers return
//! the simulation events to publish and never touch the bus themselves.
//! Every returned payload passes through `mark_sandboxed`, so nothing this
//! component emits can lack the `simulation_mode`/`sandbox_only` markers.
//!
//! If the deployment store is unreachable the request is refused outright -
//! no events are published - rather than risking a double deployment
//! against unknown state.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::envelope::mark_sandboxed;
use aegis_domain::fix::{ActionType, FixAction, FixDetails};
use aegis_domain::{topics, Envelope, Severity};

use aegis_state::{BeginOutcome, DeploymentStore};

use crate::error::EngineError;
use crate::telemetry::COUNTERS;

/// One executed action: its result record plus the simulation events the
/// actuator must publish on the action's behalf.
struct ActionExecution {
    result: Value,
    events: Vec<(&'static str, Envelope)>,
}

/// Executes fix deployments in the sandbox.
pub struct Actuator {
    bus: Arc<dyn MessageBus>,
    deployments: Arc<dyn DeploymentStore>,
    source_id: String,
}

impl Actuator {
    pub fn new(bus: Arc<dyn MessageBus>, deployments: Arc<dyn DeploymentStore>) -> Arc<Self> {
        Arc::new(Actuator {
            bus,
            deployments,
            source_id: "actuator".to_string(),
        })
    }

    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        self.bus
            .subscribe(topics::FIX_DEPLOY_REQUESTED, self.clone())
            .await?;
        self.bus
            .subscribe(topics::FIX_ROLLBACK_REQUESTED, self.clone())
            .await?;
        Ok(())
    }

    // -- sandboxed action handlers ------------------------------------------
    //
    // Each returns events; none publishes. All emitted details pass through
    // mark_sandboxed.

    fn simulation_envelope(
        &self,
        severity: Severity,
        sector: &str,
        summary: String,
        correlation: &str,
        mut details: Value,
    ) -> Envelope {
        mark_sandboxed(&mut details);
        Envelope::new(&self.source_id, severity, sector, summary)
            .with_correlation(correlation)
            .with_details(details)
    }

    fn execute_transit(
        &self,
        action: &FixAction,
        fix_id: &str,
        correlation: &str,
        sector: &str,
    ) -> ActionExecution {
        let route_id = action
            .target
            .route_id
            .clone()
            .unwrap_or_else(|| "UNKNOWN".to_string());

        let event = self.simulation_envelope(
            Severity::Info,
            sector,
            format!("Transit mitigation applied: reroute {route_id} (fix {fix_id})"),
            correlation,
            json!({
                "fix_id": fix_id,
                "action_type": ActionType::TransitRerouteSim.as_str(),
                "route_id": route_id,
                "target": &action.target,
                "params": &action.params,
            }),
        );

        ActionExecution {
            result: json!({"success": true, "action": "transit_reroute", "route_id": route_id}),
            events: vec![(topics::TRANSIT_MITIGATION_APPLIED, event)],
        }
    }

    fn execute_traffic(
        &self,
        action: &FixAction,
        fix_id: &str,
        correlation: &str,
        sector: &str,
    ) -> ActionExecution {
        let risk_area = self.simulation_envelope(
            Severity::Info,
            sector,
            format!("Traffic advisory: risk area reduction (fix {fix_id})"),
            correlation,
            json!({
                "fix_id": fix_id,
                "action_type": ActionType::TrafficAdvisorySim.as_str(),
                "risk_type": "traffic_advisory",
                "risk_level": "reduced",
                "area_bbox": &action.target.area_bbox,
                "target": &action.target,
                "params": &action.params,
            }),
        );

        let notification = self.simulation_envelope(
            Severity::Info,
            sector,
            format!("Traffic advisory notification: risk area reduced (fix {fix_id})"),
            correlation,
            json!({
                "fix_id": fix_id,
                "notification_type": "traffic_advisory",
                "message": format!("Traffic risk area reduced in {sector}"),
            }),
        );

        ActionExecution {
            result: json!({"success": true, "action": "traffic_advisory"}),
            events: vec![
                (topics::GEO_RISK_AREA, risk_area),
                (topics::SYSTEM_ACTION, notification),
            ],
        }
    }

    fn execute_airspace(
        &self,
        action: &FixAction,
        fix_id: &str,
        correlation: &str,
        sector: &str,
    ) -> ActionExecution {
        let event = self.simulation_envelope(
            Severity::Info,
            sector,
            format!("Airspace mitigation applied (fix {fix_id})"),
            correlation,
            json!({
                "fix_id": fix_id,
                "action_type": ActionType::AirspaceMitigationSim.as_str(),
                "target": &action.target,
                "params": &action.params,
            }),
        );

        ActionExecution {
            result: json!({"success": true, "action": "airspace_mitigation"}),
            events: vec![(topics::AIRSPACE_MITIGATION_APPLIED, event)],
        }
    }

    fn execute_power(
        &self,
        action: &FixAction,
        fix_id: &str,
        correlation: &str,
        sector: &str,
    ) -> ActionExecution {
        let target_sector = action
            .target
            .sector_id
            .clone()
            .unwrap_or_else(|| sector.to_string());

        let event = self.simulation_envelope(
            Severity::Warning,
            &target_sector,
            format!("Power recovery action executed (fix {fix_id})"),
            correlation,
            json!({
                "fix_id": fix_id,
                "action_type": ActionType::PowerRecoverySim.as_str(),
                "action": "power_recovery",
                "target": &action.target,
                "params": &action.params,
            }),
        );

        ActionExecution {
            result: json!({"success": true, "action": "power_recovery", "sector_id": target_sector}),
            events: vec![(topics::SYSTEM_ACTION, event)],
        }
    }

    fn execute_rollback_action(
        &self,
        action: &FixAction,
        fix_id: &str,
        correlation: &str,
        sector: &str,
    ) -> ActionExecution {
        let event = self.simulation_envelope(
            Severity::Warning,
            sector,
            format!("Rollback executed for fix {fix_id}"),
            correlation,
            json!({
                "fix_id": fix_id,
                "action_type": ActionType::RollbackSim.as_str(),
                "action": "rollback",
                "target": &action.target,
                "params": &action.params,
            }),
        );

        ActionExecution {
            result: json!({"success": true, "action": "rollback"}),
            events: vec![(topics::SYSTEM_ACTION, event)],
        }
    }

    fn execute_action(
        &self,
        action: &FixAction,
        fix_id: &str,
        correlation: &str,
        sector: &str,
    ) -> crate::Result<ActionExecution> {
        match &action.action_type {
            ActionType::TransitRerouteSim => {
                Ok(self.execute_transit(action, fix_id, correlation, sector))
            }
            ActionType::TrafficAdvisorySim => {
                Ok(self.execute_traffic(action, fix_id, correlation, sector))
            }
            ActionType::AirspaceMitigationSim => {
                Ok(self.execute_airspace(action, fix_id, correlation, sector))
            }
            ActionType::PowerRecoverySim => {
                Ok(self.execute_power(action, fix_id, correlation, sector))
            }
            ActionType::RollbackSim => {
                Ok(self.execute_rollback_action(action, fix_id, correlation, sector))
            }
            ActionType::Other(unknown) => Err(EngineError::Invariant(format!(
                "unknown action type: {unknown}"
            ))),
        }
    }

    // -- lifecycle publications ---------------------------------------------

    fn now_string() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    async fn publish_lifecycle(
        &self,
        topic: &str,
        severity: Severity,
        sector: &str,
        summary: String,
        correlation: &str,
        details: &FixDetails,
    ) -> crate::Result<()> {
        let envelope = Envelope::new(&self.source_id, severity, sector, summary)
            .with_correlation(correlation)
            .with_details(details.to_value()?);
        self.bus.publish(topic, &envelope).await?;
        Ok(())
    }

    // -- deploy request handling --------------------------------------------

    async fn on_deploy_request(&self, envelope: &Envelope) -> crate::Result<()> {
        let mut details = FixDetails::from_value(&envelope.details)?;
        let fix_id = details.fix_id.clone();
        let correlation = envelope.correlation_or_event_id();
        let sector = envelope.sector_id.clone();

        info!(fix_id = %fix_id, "deploy request received");

        // Idempotency check-then-set, atomic inside the store. A store
        // error refuses the deployment (fail closed) before any event goes
        // out.
        match self.deployments.begin(&fix_id, envelope.details.clone()).await? {
            BeginOutcome::AlreadyActive(status) => {
                warn!(fix_id = %fix_id, status = %status, "already deployed, skipping (idempotent)");
                return Ok(());
            }
            BeginOutcome::Retry => {
                info!(fix_id = %fix_id, "previous deployment failed, retrying");
            }
            BeginOutcome::Fresh => {}
        }

        details
            .extra
            .insert("deploy_started_at".to_string(), json!(Self::now_string()));
        self.publish_lifecycle(
            topics::FIX_DEPLOY_STARTED,
            Severity::Warning,
            &sector,
            format!("Deployment started for fix {fix_id}"),
            &correlation,
            &details,
        )
        .await?;

        if details.actions.is_empty() {
            return self
                .finish_failed(&mut details, &correlation, &sector, "no actions to execute")
                .await;
        }

        let actions = details.actions.clone();
        let total = actions.len();
        let mut executed: Vec<Value> = Vec::with_capacity(total);
        let mut failures: Vec<Value> = Vec::new();

        for (index, action) in actions.iter().enumerate() {
            info!(
                fix_id = %fix_id,
                action = %action.action_type,
                step = index + 1,
                total,
                "executing action"
            );
            match self.execute_action(action, &fix_id, &correlation, &sector) {
                Ok(execution) => {
                    for (topic, event) in &execution.events {
                        debug_assert!(event.is_sandboxed());
                        self.bus.publish(topic, event).await?;
                    }
                    executed.push(execution.result);
                }
                Err(e) => {
                    error!(fix_id = %fix_id, action = %action.action_type, error = %e, "action failed");
                    executed.push(json!({"success": false, "error": e.to_string()}));
                    failures.push(json!({
                        "action_index": index + 1,
                        "action_type": action.action_type.as_str(),
                        "error": e.to_string(),
                    }));
                }
            }
        }

        if failures.is_empty() {
            details.deployed_at = Some(Utc::now());
            details
                .extra
                .insert("deploy_succeeded_at".to_string(), json!(Self::now_string()));
            details
                .extra
                .insert("actions_executed".to_string(), json!(executed));
            self.publish_lifecycle(
                topics::FIX_DEPLOY_SUCCEEDED,
                Severity::Info,
                &sector,
                format!("Deployment succeeded for fix {fix_id}"),
                &correlation,
                &details,
            )
            .await?;
            self.deployments.complete(&fix_id, executed).await?;
            COUNTERS.inc_deployments_executed();
            info!(fix_id = %fix_id, "all actions executed");
            Ok(())
        } else {
            let message = serde_json::to_string(&failures).unwrap_or_default();
            self.finish_failed(
                &mut details,
                &correlation,
                &sector,
                &format!("some actions failed: {message}"),
            )
            .await
        }
    }

    async fn finish_failed(
        &self,
        details: &mut FixDetails,
        correlation: &str,
        sector: &str,
        error: &str,
    ) -> crate::Result<()> {
        let fix_id = details.fix_id.clone();
        details
            .extra
            .insert("deploy_failed_at".to_string(), json!(Self::now_string()));
        details.extra.insert("error".to_string(), json!(error));
        self.publish_lifecycle(
            topics::FIX_DEPLOY_FAILED,
            Severity::Critical,
            sector,
            format!("Deployment failed for fix {fix_id}: {error}"),
            correlation,
            details,
        )
        .await?;
        self.deployments.fail(&fix_id, error).await?;
        error!(fix_id = %fix_id, error, "deployment failed");
        Ok(())
    }

    // -- rollback handling --------------------------------------------------

    async fn on_rollback_request(&self, envelope: &Envelope) -> crate::Result<()> {
        let mut details = FixDetails::from_value(&envelope.details)?;
        let fix_id = details.fix_id.clone();
        let correlation = envelope.correlation_or_event_id();
        let sector = envelope.sector_id.clone();

        // The verifier attaches the rollback action; fall back to reversing
        // the first deployed action's target.
        let rollback_action: FixAction = match details.extra.get("suggested_rollback_action") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(aegis_domain::DomainError::from)?,
            None => FixAction {
                action_type: ActionType::RollbackSim,
                target: details
                    .actions
                    .first()
                    .map(|a| a.target.clone())
                    .unwrap_or_default(),
                params: serde_json::Map::new(),
                verification: None,
            },
        };

        // Rollbacks are idempotent on their own key.
        let rollback_key = format!("{fix_id}:rollback");
        match self
            .deployments
            .begin(&rollback_key, envelope.details.clone())
            .await?
        {
            BeginOutcome::AlreadyActive(status) => {
                warn!(fix_id = %fix_id, status = %status, "rollback already handled, skipping");
                return Ok(());
            }
            BeginOutcome::Fresh | BeginOutcome::Retry => {}
        }

        info!(fix_id = %fix_id, "executing rollback");
        let execution =
            self.execute_rollback_action(&rollback_action, &fix_id, &correlation, &sector);
        for (topic, event) in &execution.events {
            debug_assert!(event.is_sandboxed());
            self.bus.publish(topic, event).await?;
        }

        details
            .extra
            .insert("rollback_succeeded_at".to_string(), json!(Self::now_string()));
        self.publish_lifecycle(
            topics::FIX_ROLLBACK_SUCCEEDED,
            Severity::Info,
            &sector,
            format!("Rollback succeeded for fix {fix_id}"),
            &correlation,
            &details,
        )
        .await?;
        self.deployments
            .complete(&rollback_key, vec![execution.result])
            .await?;
        info!(fix_id = %fix_id, "rollback succeeded");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for Actuator {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        let result = match topic {
            topics::FIX_DEPLOY_REQUESTED => self.on_deploy_request(&envelope).await,
            topics::FIX_ROLLBACK_REQUESTED => self.on_rollback_request(&envelope).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            if e.is_transient() {
                // Fail closed: refuse the deployment rather than act on
                // unknown store state; redelivery or the operator retries.
                warn!(topic, error = %e, "deployment refused, store unreachable");
            } else {
                warn!(topic, error = %e, "actuator handler failed");
            }
        }
    }
}
