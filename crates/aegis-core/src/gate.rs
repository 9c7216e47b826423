//! Approval gate
//!
//! Consumes human review decisions from the `fix.review.decision` control
//! topic. The only validation performed: the fix exists and its latest
//! lifecycle event is `fix.review_required`, checked against the event
//! store. Approve publishes `fix.approved` and then `fix.deploy_requested`;
//! reject publishes `fix.rejected` only.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::fix::FixDetails;
use aegis_domain::{topics, Envelope, Severity};

use aegis_state::{EventQuery, EventStore};

use crate::error::EngineError;

/// How far back the gate searches for a fix's lifecycle events.
const REVIEW_LOOKBACK_HOURS: i64 = 168;

/// A review decision submitted from the human surface.
#[derive(Debug, Deserialize)]
pub struct ReviewDecision {
    pub fix_id: String,
    pub approve: bool,
    #[serde(default = "default_reviewer")]
    pub reviewer: String,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_reviewer() -> String {
    "operator".to_string()
}

/// Gate between human review and actuation.
pub struct ApprovalGate {
    bus: Arc<dyn MessageBus>,
    events: Arc<dyn EventStore>,
    source_id: String,
}

impl ApprovalGate {
    pub fn new(bus: Arc<dyn MessageBus>, events: Arc<dyn EventStore>) -> Arc<Self> {
        Arc::new(ApprovalGate {
            bus,
            events,
            source_id: "approval-gate".to_string(),
        })
    }

    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        self.bus
            .subscribe(topics::FIX_REVIEW_DECISION, self.clone())
            .await?;
        Ok(())
    }

    /// All lifecycle events recorded for a fix inside the lookback window.
    async fn lifecycle_events(
        &self,
        fix_id: &str,
    ) -> crate::Result<Vec<aegis_state::StoredEvent>> {
        let lifecycle: Vec<String> = topics::fix_topics()
            .iter()
            .filter(|t| **t != topics::FIX_REVIEW_DECISION)
            .map(|t| t.to_string())
            .collect();
        let now = Utc::now();
        let query = EventQuery::new(lifecycle, now - Duration::hours(REVIEW_LOOKBACK_HOURS), now)
            .with_field_eq("details.fix_id", serde_json::json!(fix_id));
        Ok(self.events.query(&query).await?)
    }

    async fn on_decision(&self, envelope: &Envelope) -> crate::Result<()> {
        let decision: ReviewDecision = serde_json::from_value(envelope.details.clone())
            .map_err(aegis_domain::DomainError::from)?;

        // In review_required state: a review request exists and nothing has
        // already decided or deployed the fix. Existence checks rather than
        // latest-event ordering, because sibling events published in the
        // same instant carry no reliable order.
        let events = self.lifecycle_events(&decision.fix_id).await?;
        let review_request = events
            .iter()
            .rev()
            .find(|e| e.topic == topics::FIX_REVIEW_REQUIRED);
        let Some(review_request) = review_request else {
            return Err(EngineError::Invariant(format!(
                "review decision for fix {} with no pending review",
                decision.fix_id
            )));
        };
        if let Some(decided) = events.iter().find(|e| {
            matches!(
                e.topic.as_str(),
                t if t == topics::FIX_APPROVED
                    || t == topics::FIX_REJECTED
                    || t == topics::FIX_DEPLOY_REQUESTED
            )
        }) {
            return Err(EngineError::Invariant(format!(
                "fix {} already decided ({})",
                decision.fix_id, decided.topic
            )));
        }

        let mut details = FixDetails::from_value(&review_request.envelope.details)?;
        details.approved_by = Some(decision.reviewer.clone());
        details.review_notes = decision.notes.clone();

        let correlation = review_request.envelope.correlation_or_event_id();
        let sector = review_request.envelope.sector_id.clone();

        if decision.approve {
            let approval = Envelope::new(
                &self.source_id,
                Severity::Info,
                &sector,
                format!("Fix {} approved by {}", details.fix_id, decision.reviewer),
            )
            .with_correlation(&correlation)
            .with_details(details.to_value()?);
            self.bus.publish(topics::FIX_APPROVED, &approval).await?;

            // Deploy request strictly after approval, same task.
            let deploy = Envelope::new(
                &self.source_id,
                Severity::Warning,
                &sector,
                format!("Deployment requested for fix {}", details.fix_id),
            )
            .with_correlation(&correlation)
            .with_details(details.to_value()?);
            self.bus.publish(topics::FIX_DEPLOY_REQUESTED, &deploy).await?;

            info!(fix_id = %details.fix_id, reviewer = %decision.reviewer, "fix approved");
        } else {
            let rejection = Envelope::new(
                &self.source_id,
                Severity::Info,
                &sector,
                format!("Fix {} rejected by {}", details.fix_id, decision.reviewer),
            )
            .with_correlation(&correlation)
            .with_details(details.to_value()?);
            self.bus.publish(topics::FIX_REJECTED, &rejection).await?;

            info!(fix_id = %details.fix_id, reviewer = %decision.reviewer, "fix rejected");
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for ApprovalGate {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        if let Err(e) = self.on_decision(&envelope).await {
            warn!(topic, error = %e, "review decision not applied");
        }
    }
}
