//! Defense verifier
//!
//! Observes a fixed window after each deployed defense action and decides
//! whether the threat's indicators normalized: indicator event count down
//! at least half versus the pre-detection baseline, or peak severity down a
//! level, or the window silent. New threats during the window veto
//! normalization. Normalized threats get `defense.threat.resolved`;
//! everything else leaves an escalation suggestion in the verification
//! record.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::threat::DEFENSE_DISCLAIMER;
use aegis_domain::{topics, Envelope, Severity};

use aegis_state::{
    EventQuery, EventStore, StoredEvent, TimelineEntry, VerificationStatus, VerificationStore,
};

use crate::schedule::WakeQueue;

/// Topics whose traffic counts as a threat indicator.
const INDICATOR_TOPICS: &[&str] = &[
    topics::AIRSPACE_CONFLICT_DETECTED,
    topics::AIRSPACE_HOTSPOT_DETECTED,
    topics::TRANSIT_DISRUPTION_RISK,
    topics::POWER_FAILURE,
    topics::GEO_INCIDENT,
    topics::GEO_RISK_AREA,
];

/// Required indicator-count reduction for normalization.
const EVENT_COUNT_REDUCTION: f64 = 0.5;

struct DefenseVerificationTask {
    threat_id: String,
    action_id: String,
    deploy_time: DateTime<Utc>,
    sector: String,
}

/// Outcome of a normalization check with its reasoning.
struct Normalization {
    normalized: bool,
    reason: String,
    escalation: Option<String>,
}

/// Verifies that deployed defense actions normalized threat indicators.
pub struct DefenseVerifier {
    bus: Arc<dyn MessageBus>,
    events: Arc<dyn EventStore>,
    records: Arc<dyn VerificationStore>,
    window_secs: i64,
    queue: WakeQueue<DefenseVerificationTask>,
    source_id: String,
}

impl DefenseVerifier {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        events: Arc<dyn EventStore>,
        records: Arc<dyn VerificationStore>,
        window_secs: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<DefenseVerifier>| {
            let weak = weak.clone();
            let queue = WakeQueue::spawn(move |task: DefenseVerificationTask| {
                let weak = weak.clone();
                async move {
                    if let Some(verifier) = weak.upgrade() {
                        verifier.run_verification(task).await;
                    }
                }
            });
            DefenseVerifier {
                bus,
                events,
                records,
                window_secs: window_secs as i64,
                queue,
                source_id: "defense-verifier".to_string(),
            }
        })
    }

    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        self.bus
            .subscribe(topics::DEFENSE_ACTION_DEPLOYED, self.clone())
            .await?;
        Ok(())
    }

    async fn on_action_deployed(&self, envelope: &Envelope) -> crate::Result<()> {
        let details = &envelope.details;
        let threat_id = details
            .get("threat_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                crate::EngineError::Invariant("deployed action without threat_id".to_string())
            })?
            .to_string();
        let action_id = details
            .get("action_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        // Keyed by threat: multiple actions for one threat share the record
        // and the last deployment wins the observation window.
        self.records.begin(&threat_id, details.clone()).await?;

        let deploy_time = details
            .get("deployed_at")
            .and_then(|v| v.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(envelope.timestamp);

        let wake_at = deploy_time + Duration::seconds(self.window_secs);
        info!(threat_id = %threat_id, wake_at = %wake_at, "defense verification scheduled");
        self.queue.enqueue(
            wake_at,
            DefenseVerificationTask {
                threat_id,
                action_id,
                deploy_time,
                sector: envelope.sector_id.clone(),
            },
        );
        Ok(())
    }

    /// Startup recovery for interrupted defense verifications.
    pub async fn resume_pending(self: &Arc<Self>) -> crate::Result<()> {
        for record in self.records.list_in_progress().await? {
            let deploy_time = record
                .details
                .get("deployed_at")
                .and_then(|v| v.as_str())
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|ts| ts.with_timezone(&Utc))
                .unwrap_or(record.started_at);
            let action_id = record
                .details
                .get("action_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            info!(threat_id = %record.key, "resuming interrupted defense verification");
            self.queue.enqueue(
                deploy_time + Duration::seconds(self.window_secs),
                DefenseVerificationTask {
                    threat_id: record.key.clone(),
                    action_id,
                    deploy_time,
                    sector: "unknown".to_string(),
                },
            );
        }
        Ok(())
    }

    async fn indicator_events(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> crate::Result<Vec<StoredEvent>> {
        let query = EventQuery::new(
            INDICATOR_TOPICS.iter().map(|t| t.to_string()).collect(),
            since,
            until,
        );
        Ok(self.events.query(&query).await?)
    }

    async fn new_threats_in(
        &self,
        threat_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> crate::Result<usize> {
        let query = EventQuery::new(
            vec![topics::DEFENSE_THREAT_DETECTED.to_string()],
            since,
            until,
        );
        let detections = self.events.query(&query).await?;
        Ok(detections
            .iter()
            .filter(|e| {
                e.envelope.details.get("threat_id").and_then(|v| v.as_str()) != Some(threat_id)
            })
            .count())
    }

    fn max_severity(events: &[StoredEvent]) -> Option<Severity> {
        events.iter().map(|e| e.envelope.severity).max()
    }

    fn check_normalization(
        baseline_count: usize,
        baseline_severity: Option<Severity>,
        current_count: usize,
        current_severity: Option<Severity>,
        new_threats: usize,
    ) -> Normalization {
        if baseline_count > 0 {
            let reduction = (baseline_count as f64 - current_count as f64) / baseline_count as f64;
            if reduction >= EVENT_COUNT_REDUCTION {
                return Normalization {
                    normalized: true,
                    reason: format!("indicator count reduced by {:.0}%", reduction * 100.0),
                    escalation: None,
                };
            }
        }

        if let (Some(baseline), Some(current)) = (baseline_severity, current_severity) {
            if current < baseline {
                return Normalization {
                    normalized: true,
                    reason: format!("severity reduced from {baseline} to {current}"),
                    escalation: None,
                };
            }
        }

        if new_threats > 0 {
            return Normalization {
                normalized: false,
                reason: format!("{new_threats} new threat(s) detected in window"),
                escalation: Some("escalate threat assessment".to_string()),
            };
        }

        if current_count == 0 && baseline_count > 0 {
            return Normalization {
                normalized: true,
                reason: "no threat-related events in verification window".to_string(),
                escalation: None,
            };
        }

        Normalization {
            normalized: false,
            reason: "threat indicators have not normalized sufficiently".to_string(),
            escalation: Some("monitor closely; consider additional protective actions".to_string()),
        }
    }

    async fn run_verification(&self, task: DefenseVerificationTask) {
        if let Err(e) = self.verification_pass(&task).await {
            warn!(threat_id = %task.threat_id, error = %e, "defense verification failed");
        }
    }

    async fn verification_pass(&self, task: &DefenseVerificationTask) -> crate::Result<()> {
        let window = Duration::seconds(self.window_secs);
        let baseline_events = self
            .indicator_events(task.deploy_time - window, task.deploy_time)
            .await?;
        let window_end = (task.deploy_time + window).min(Utc::now());
        let current_events = self.indicator_events(task.deploy_time, window_end).await?;
        let new_threats = self
            .new_threats_in(&task.threat_id, task.deploy_time, window_end)
            .await?;

        let verdict = Self::check_normalization(
            baseline_events.len(),
            Self::max_severity(&baseline_events),
            current_events.len(),
            Self::max_severity(&current_events),
            new_threats,
        );

        let evidence = json!({
            "baseline_count": baseline_events.len(),
            "current_count": current_events.len(),
            "new_threats": new_threats,
            "window_seconds": self.window_secs,
            "reason": verdict.reason,
        });

        if verdict.normalized {
            self.records
                .complete(
                    &task.threat_id,
                    VerificationStatus::Verified,
                    vec![evidence.clone()],
                    evidence,
                    None,
                )
                .await?;

            let resolved = Envelope::new(
                &self.source_id,
                Severity::Info,
                &task.sector,
                format!("Threat {} resolved: {}", task.threat_id, verdict.reason),
            )
            .with_correlation(&task.threat_id)
            .with_details(json!({
                "threat_id": task.threat_id,
                "action_id": task.action_id,
                "resolved_at": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "reason": verdict.reason,
                "disclaimer": DEFENSE_DISCLAIMER,
            }));
            self.bus
                .publish(topics::DEFENSE_THREAT_RESOLVED, &resolved)
                .await?;
            info!(threat_id = %task.threat_id, "threat resolved");
        } else {
            let escalation = verdict.escalation.unwrap_or_default();
            self.records
                .append_timeline(
                    &task.threat_id,
                    TimelineEntry::now("escalation_suggested", &escalation)
                        .with_data(evidence.clone()),
                )
                .await?;
            self.records
                .complete(
                    &task.threat_id,
                    VerificationStatus::Failed,
                    vec![evidence.clone()],
                    evidence,
                    Some(verdict.reason.clone()),
                )
                .await?;
            warn!(
                threat_id = %task.threat_id,
                reason = %verdict.reason,
                escalation = %escalation,
                "threat not normalized"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for DefenseVerifier {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        if let Err(e) = self.on_action_deployed(&envelope).await {
            warn!(topic, error = %e, "defense verifier handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_reduction_normalizes() {
        let verdict = DefenseVerifier::check_normalization(10, None, 4, None, 0);
        assert!(verdict.normalized);
        assert!(verdict.reason.contains("60%"));
    }

    #[test]
    fn insufficient_reduction_suggests_escalation() {
        let verdict = DefenseVerifier::check_normalization(10, None, 8, None, 0);
        assert!(!verdict.normalized);
        assert!(verdict.escalation.is_some());
    }

    #[test]
    fn severity_drop_normalizes() {
        let verdict = DefenseVerifier::check_normalization(
            4,
            Some(Severity::Critical),
            3,
            Some(Severity::Warning),
            0,
        );
        assert!(verdict.normalized);
    }

    #[test]
    fn new_threats_veto_normalization() {
        let verdict = DefenseVerifier::check_normalization(10, None, 9, None, 2);
        assert!(!verdict.normalized);
        assert!(verdict.reason.contains("new threat"));
    }

    #[test]
    fn silent_window_after_activity_normalizes() {
        let verdict = DefenseVerifier::check_normalization(3, None, 0, None, 0);
        assert!(verdict.normalized);
    }

    #[test]
    fn empty_baseline_and_window_stays_unresolved() {
        let verdict = DefenseVerifier::check_normalization(0, None, 0, None, 0);
        assert!(!verdict.normalized);
    }
}
