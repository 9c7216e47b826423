//! Fix proposer agent
//!
//! Watches every non-fix topic; critical events trigger a remediation draft
//! from the planner chain. The processed-event cache is a bounded LRU so a
//! long-running proposer cannot leak memory across weeks of replayed
//! traffic.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use serde_json::Map;
use std::num::NonZeroUsize;
use tracing::{info, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::fix::FixDetails;
use aegis_domain::{topics, Envelope, Severity};

use crate::autonomy::{AutonomyHandle, AutonomyLevel};
use crate::planner::{fallback_recovery_plan, PlannerChain};
use crate::telemetry::COUNTERS;

/// Identity stamped on auto-approvals taken under HIGH autonomy.
const AUTO_APPROVER: &str = "autonomy-router-001";

/// Generates fix proposals for critical events.
pub struct FixProposer {
    bus: Arc<dyn MessageBus>,
    autonomy: AutonomyHandle,
    planners: PlannerChain,
    processed: Mutex<LruCache<String, ()>>,
    source_id: String,
}

impl FixProposer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        autonomy: AutonomyHandle,
        planners: PlannerChain,
        processed_capacity: NonZeroUsize,
    ) -> Arc<Self> {
        Arc::new(FixProposer {
            bus,
            autonomy,
            planners,
            processed: Mutex::new(LruCache::new(processed_capacity)),
            source_id: "fix-proposer".to_string(),
        })
    }

    /// Subscribe to every trigger topic. Fix lifecycle topics are excluded
    /// by construction, so the proposer can never feed on its own output.
    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        for topic in topics::trigger_topics() {
            self.bus.subscribe(topic, self.clone()).await?;
        }
        Ok(())
    }

    fn already_processed(&self, event_id: &str) -> bool {
        self.processed
            .lock()
            .expect("processed lock poisoned")
            .contains(event_id)
    }

    fn mark_processed(&self, event_id: &str) {
        self.processed
            .lock()
            .expect("processed lock poisoned")
            .put(event_id.to_string(), ());
    }

    async fn on_event(&self, topic: &str, trigger: &Envelope) -> crate::Result<()> {
        // Loop prevention; the subscription set already excludes these.
        if topics::fix_topics().iter().any(|t| *t == topic) {
            return Ok(());
        }
        if trigger.severity != Severity::Critical {
            return Ok(());
        }

        let event_id = trigger.event_id.to_string();
        if self.already_processed(&event_id) {
            return Ok(());
        }

        let correlation_id = trigger.correlation_or_event_id();
        info!(
            topic,
            event_id = %event_id,
            sector = %trigger.sector_id,
            "critical event detected, generating fix proposal"
        );

        let draft = self.planners.propose_fix(topic, trigger).await?;

        let autonomy = self.autonomy.level();
        let requires_human_approval = !(autonomy == AutonomyLevel::High
            && draft.risk_level != aegis_domain::fix::RiskLevel::High);

        let details = FixDetails {
            fix_id: FixDetails::mint_id(Utc::now()),
            correlation_id: correlation_id.clone(),
            source: draft.source,
            title: draft.title,
            summary: draft.summary,
            actions: draft.actions,
            risk_level: draft.risk_level,
            expected_impact: draft.expected_impact,
            created_at: Utc::now(),
            proposed_by: self.source_id.clone(),
            requires_human_approval,
            review_notes: None,
            approved_by: None,
            deployed_at: None,
            verified_at: None,
            rollback_reason: None,
            extra: Map::new(),
        };
        details.validate()?;

        let proposed = Envelope::new(
            &self.source_id,
            Severity::Warning,
            &trigger.sector_id,
            format!("Fix {} proposed: {}", details.fix_id, details.title),
        )
        .with_correlation(&correlation_id)
        .with_details(details.to_value()?);
        self.bus.publish(topics::FIX_PROPOSED, &proposed).await?;
        COUNTERS.inc_fixes_proposed();
        info!(fix_id = %details.fix_id, risk = ?details.risk_level, "fix proposed");

        if requires_human_approval {
            // Identical details, distinct event.
            let review = Envelope::new(
                &self.source_id,
                Severity::Warning,
                &trigger.sector_id,
                format!("Fix {} requires human review", details.fix_id),
            )
            .with_correlation(&correlation_id)
            .with_details(details.to_value()?);
            self.bus.publish(topics::FIX_REVIEW_REQUIRED, &review).await?;
        } else {
            // HIGH autonomy: the router identity approves, and the deploy
            // request is published strictly after the approval.
            let mut approved = details.clone();
            approved.approved_by = Some(AUTO_APPROVER.to_string());
            approved.review_notes = Some("Auto-approved under HIGH autonomy".to_string());

            let approval = Envelope::new(
                &self.source_id,
                Severity::Info,
                &trigger.sector_id,
                format!("Fix {} auto-approved (HIGH autonomy)", approved.fix_id),
            )
            .with_correlation(&correlation_id)
            .with_details(approved.to_value()?);
            self.bus.publish(topics::FIX_APPROVED, &approval).await?;

            let deploy = Envelope::new(
                &self.source_id,
                Severity::Warning,
                &trigger.sector_id,
                format!("Deployment requested for fix {}", approved.fix_id),
            )
            .with_correlation(&correlation_id)
            .with_details(approved.to_value()?);
            self.bus.publish(topics::FIX_DEPLOY_REQUESTED, &deploy).await?;
        }

        // Critical power failures also get a recovery plan for the
        // autonomy router to route.
        if topic == topics::POWER_FAILURE {
            let plan = Envelope::new(
                &self.source_id,
                Severity::Warning,
                &trigger.sector_id,
                format!("Recovery plan drafted for {}", trigger.sector_id),
            )
            .with_correlation(&correlation_id)
            .with_details(fallback_recovery_plan(trigger));
            self.bus.publish(topics::RECOVERY_PLAN, &plan).await?;
        }

        self.mark_processed(&event_id);
        Ok(())
    }
}

#[async_trait]
impl EventHandler for FixProposer {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        if let Err(e) = self.on_event(topic, &envelope).await {
            warn!(topic, error = %e, "fix proposer handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_cache_is_bounded() {
        let bus = Arc::new(aegis_bus::MemoryBus::new());
        let proposer = FixProposer::new(
            bus,
            AutonomyHandle::new(AutonomyLevel::Normal),
            PlannerChain::rules_only(300),
            NonZeroUsize::new(2).unwrap(),
        );

        proposer.mark_processed("a");
        proposer.mark_processed("b");
        proposer.mark_processed("c");
        // Oldest entry evicted at capacity 2.
        assert!(!proposer.already_processed("a"));
        assert!(proposer.already_processed("b"));
        assert!(proposer.already_processed("c"));
    }
}
