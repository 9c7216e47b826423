//! Operator autonomy level and the autonomy router
//!
//! The level is process-local state owned by one router, but it is held in
//! an explicit [`AutonomyHandle`] injected at construction so the proposer
//! can consult it and tests can flip it directly - no globals.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::{topics, Envelope, Severity};

use crate::error::EngineError;

/// Operator autonomy level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutonomyLevel {
    Normal,
    High,
}

impl AutonomyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyLevel::Normal => "NORMAL",
            AutonomyLevel::High => "HIGH",
        }
    }
}

impl FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(AutonomyLevel::Normal),
            "HIGH" => Ok(AutonomyLevel::High),
            other => Err(format!("unknown autonomy level: {other}")),
        }
    }
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct AutonomyState {
    level: Option<AutonomyLevel>,
    operator_id: Option<String>,
    operator_name: Option<String>,
}

/// Shared, injectable view of the current autonomy level.
#[derive(Clone)]
pub struct AutonomyHandle {
    inner: Arc<RwLock<AutonomyState>>,
    initial: AutonomyLevel,
}

impl AutonomyHandle {
    pub fn new(initial: AutonomyLevel) -> Self {
        AutonomyHandle {
            inner: Arc::new(RwLock::new(AutonomyState::default())),
            initial,
        }
    }

    pub fn level(&self) -> AutonomyLevel {
        self.inner
            .read()
            .expect("autonomy lock poisoned")
            .level
            .unwrap_or(self.initial)
    }

    pub fn set_level(&self, level: AutonomyLevel) {
        self.inner.write().expect("autonomy lock poisoned").level = Some(level);
    }

    fn set_operator(&self, id: Option<String>, name: Option<String>) {
        let mut state = self.inner.write().expect("autonomy lock poisoned");
        state.operator_id = id;
        state.operator_name = name;
    }

    fn operator(&self) -> (Option<String>, Option<String>) {
        let state = self.inner.read().expect("autonomy lock poisoned");
        (state.operator_id.clone(), state.operator_name.clone())
    }
}

/// Routes recovery plans based on the operator autonomy level.
///
/// - HIGH: synthesize a decision and execute automatically (publishes
///   `audit.decision` and `system.action`)
/// - NORMAL: request human approval (publishes `approval.required` with a
///   one-hour expiry)
pub struct AutonomyRouter {
    bus: Arc<dyn MessageBus>,
    handle: AutonomyHandle,
    agent_id: String,
}

impl AutonomyRouter {
    pub fn new(bus: Arc<dyn MessageBus>, handle: AutonomyHandle) -> Arc<Self> {
        Arc::new(AutonomyRouter {
            bus,
            handle,
            agent_id: "autonomy-router-001".to_string(),
        })
    }

    /// Subscribe to the router's input topics.
    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        self.bus
            .subscribe(topics::OPERATOR_STATUS, self.clone())
            .await?;
        self.bus.subscribe(topics::RECOVERY_PLAN, self.clone()).await?;
        Ok(())
    }

    fn on_operator_status(&self, envelope: &Envelope) {
        let details = &envelope.details;
        let Some(raw_level) = details.get("autonomy_level").and_then(|v| v.as_str()) else {
            return;
        };
        match raw_level.parse::<AutonomyLevel>() {
            Ok(level) => {
                let previous = self.handle.level();
                self.handle.set_level(level);
                self.handle.set_operator(
                    details
                        .get("operator_id")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    details
                        .get("operator_name")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                );
                info!(previous = %previous, current = %level, "autonomy level update");
            }
            Err(e) => warn!(error = %e, "ignoring operator status"),
        }
    }

    async fn on_recovery_plan(&self, envelope: &Envelope) -> crate::Result<()> {
        let details = &envelope.details;
        let plan_id = details
            .get("plan_id")
            .and_then(|v| v.as_str())
            .ok_or(EngineError::Invariant("recovery plan without plan_id".into()))?
            .to_string();
        let plan_name = details
            .get("plan_name")
            .and_then(|v| v.as_str())
            .unwrap_or("unnamed plan")
            .to_string();
        let status = details.get("status").and_then(|v| v.as_str()).unwrap_or("");

        // Only draft and active plans are actionable.
        if !matches!(status, "draft" | "active") {
            info!(plan_id = %plan_id, status, "skipping recovery plan");
            return Ok(());
        }

        match self.handle.level() {
            AutonomyLevel::High => self.execute_autonomous(envelope, &plan_id, &plan_name).await,
            AutonomyLevel::Normal => self.request_approval(envelope, &plan_id, &plan_name).await,
        }
    }

    async fn execute_autonomous(
        &self,
        trigger: &Envelope,
        plan_id: &str,
        plan_name: &str,
    ) -> crate::Result<()> {
        let decision_id = mint_tagged_id("DEC");
        let action = format!("execute_recovery_plan_{plan_id}");

        let audit = Envelope::new(
            &self.agent_id,
            Severity::Info,
            &trigger.sector_id,
            format!("Autonomous decision to execute recovery plan: {plan_name}"),
        )
        .with_correlation(trigger.correlation_or_event_id())
        .with_details(json!({
            "decision_id": decision_id,
            "decision_type": "automated",
            "decision_maker": self.agent_id,
            "action": action,
            "reasoning": format!(
                "High autonomy mode active. Automatically executing recovery plan {plan_id}."
            ),
            "outcome": "pending",
            "related_events": [trigger.event_id.to_string()],
        }));
        let audit_event_id = audit.event_id.to_string();
        self.bus.publish(topics::AUDIT_DECISION, &audit).await?;
        info!(decision_id = %decision_id, plan_id, "published audit.decision (HIGH autonomy)");

        let system_action = Envelope::new(
            &self.agent_id,
            Severity::Info,
            &trigger.sector_id,
            format!("System executing recovery plan: {plan_name}"),
        )
        .with_correlation(trigger.correlation_or_event_id())
        .with_details(json!({
            "action_type": "execute_recovery_plan",
            "plan_id": plan_id,
            "plan_name": plan_name,
            "executor": self.agent_id,
            "autonomy_level": AutonomyLevel::High.as_str(),
            "status": "executing",
            "decision_id": decision_id,
            "related_events": [trigger.event_id.to_string(), audit_event_id],
        }));
        self.bus.publish(topics::SYSTEM_ACTION, &system_action).await?;
        info!(plan_id, "published system.action (executing)");
        Ok(())
    }

    async fn request_approval(
        &self,
        trigger: &Envelope,
        plan_id: &str,
        plan_name: &str,
    ) -> crate::Result<()> {
        let (operator_id, operator_name) = self.handle.operator();
        let approval_id = mint_tagged_id("APP");
        let expires_at = (Utc::now() + Duration::hours(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let approval = Envelope::new(
            &self.agent_id,
            Severity::Warning,
            &trigger.sector_id,
            format!("Approval required for recovery plan: {plan_name}"),
        )
        .with_correlation(trigger.correlation_or_event_id())
        .with_details(json!({
            "approval_id": approval_id,
            "plan_id": plan_id,
            "plan_name": plan_name,
            "requested_by": self.agent_id,
            "operator_id": operator_id,
            "operator_name": operator_name,
            "status": "pending",
            "autonomy_level": AutonomyLevel::Normal.as_str(),
            "action_required": format!("execute_recovery_plan_{plan_id}"),
            "related_events": [trigger.event_id.to_string()],
            "expires_at": expires_at,
        }));
        self.bus.publish(topics::APPROVAL_REQUIRED, &approval).await?;
        info!(approval_id = %approval_id, plan_id, "published approval.required (NORMAL autonomy)");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for AutonomyRouter {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        let result = match topic {
            topics::OPERATOR_STATUS => {
                self.on_operator_status(&envelope);
                Ok(())
            }
            topics::RECOVERY_PLAN => self.on_recovery_plan(&envelope).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(topic, error = %e, "autonomy router handler failed");
        }
    }
}

/// `<tag>-YYYY-<8 hex uppercase>` identifiers for decisions and approvals.
fn mint_tagged_id(tag: &str) -> String {
    let tail = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("{tag}-{}-{}", Utc::now().format("%Y"), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parses_case_insensitively() {
        assert_eq!("high".parse::<AutonomyLevel>().unwrap(), AutonomyLevel::High);
        assert_eq!("NORMAL".parse::<AutonomyLevel>().unwrap(), AutonomyLevel::Normal);
        assert!("turbo".parse::<AutonomyLevel>().is_err());
    }

    #[test]
    fn handle_defaults_to_initial_level() {
        let handle = AutonomyHandle::new(AutonomyLevel::Normal);
        assert_eq!(handle.level(), AutonomyLevel::Normal);
        handle.set_level(AutonomyLevel::High);
        assert_eq!(handle.level(), AutonomyLevel::High);
    }

    #[test]
    fn tagged_id_shape() {
        let id = mint_tagged_id("DEC");
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts[0], "DEC");
        assert_eq!(parts[1].len(), 4);
        assert_eq!(parts[2].len(), 8);
    }
}
