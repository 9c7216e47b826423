//! Verification agent
//!
//! Consumes `fix.deploy_succeeded`, waits out each action's observation
//! window via the wake queue, computes the claimed metric from the event
//! store, and closes the fix: `fix.verified` when every verifiable action
//! passes (or is skipped), `fix.rollback_requested` otherwise.
//!
//! Metric computation errors mark the action skipped-with-error rather than
//! failed, so a flaky store read cannot trigger a rollback storm.
//!
//! Interrupted verifications are recoverable: records stay `in_progress`
//! and [`Verifier::resume_pending`] re-enqueues them at startup, plus a
//! backfill pass over recent `fix.deploy_succeeded` events whose record is
//! missing entirely (e.g. deployed while this component was down).

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::fix::{ActionType, FixAction, FixDetails};
use aegis_domain::{topics, Envelope, Severity};

use aegis_state::{
    EventQuery, EventStore, StoredEvent, TimelineEntry, VerificationStatus, VerificationStore,
};

use crate::metrics::{self, BaselineFactors, MetricReading};
use crate::schedule::WakeQueue;
use crate::telemetry::COUNTERS;

/// How far back the startup backfill looks for unverified deployments.
const BACKFILL_LOOKBACK_HOURS: i64 = 1;

/// One scheduled verification.
pub struct VerificationTask {
    details: FixDetails,
    deploy_time: DateTime<Utc>,
    correlation: String,
    sector: String,
}

/// Per-action verification verdict.
enum ActionVerdict {
    Passed(MetricReading),
    Failed(MetricReading),
    Skipped(String),
}

/// Verifies that deployed fixes met their claimed metrics.
pub struct Verifier {
    bus: Arc<dyn MessageBus>,
    events: Arc<dyn EventStore>,
    records: Arc<dyn VerificationStore>,
    factors: BaselineFactors,
    queue: WakeQueue<VerificationTask>,
    source_id: String,
}

impl Verifier {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        events: Arc<dyn EventStore>,
        records: Arc<dyn VerificationStore>,
        factors: BaselineFactors,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Verifier>| {
            let weak = weak.clone();
            let queue = WakeQueue::spawn(move |task: VerificationTask| {
                let weak = weak.clone();
                async move {
                    if let Some(verifier) = weak.upgrade() {
                        verifier.run_verification(task).await;
                    }
                }
            });
            Verifier {
                bus,
                events,
                records,
                factors,
                queue,
                source_id: "verifier".to_string(),
            }
        })
    }

    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        self.bus
            .subscribe(topics::FIX_DEPLOY_SUCCEEDED, self.clone())
            .await?;
        Ok(())
    }

    // -- scheduling ----------------------------------------------------------

    fn deploy_time_of(details: &FixDetails, envelope_ts: DateTime<Utc>) -> DateTime<Utc> {
        details
            .extra
            .get("deploy_succeeded_at")
            .and_then(|v| v.as_str())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(envelope_ts)
    }

    fn schedule(&self, details: FixDetails, deploy_time: DateTime<Utc>, correlation: String, sector: String) {
        let max_window = details
            .actions
            .iter()
            .filter_map(|a| a.verification.as_ref())
            .map(|v| v.window_seconds)
            .max()
            .unwrap_or(0);
        let wake_at = deploy_time + Duration::seconds(max_window as i64);

        let fix_id = details.fix_id.clone();
        let enqueued = self.queue.enqueue(
            wake_at,
            VerificationTask {
                details,
                deploy_time,
                correlation,
                sector,
            },
        );
        if enqueued {
            info!(fix_id = %fix_id, wake_at = %wake_at, "verification scheduled");
        } else {
            warn!(fix_id = %fix_id, "verification queue stopped, task dropped");
        }
    }

    async fn on_deploy_succeeded(&self, envelope: &Envelope) -> crate::Result<()> {
        let details = FixDetails::from_value(&envelope.details)?;
        self.records
            .begin(&details.fix_id, envelope.details.clone())
            .await?;

        let deploy_time = Self::deploy_time_of(&details, envelope.timestamp);
        self.schedule(
            details,
            deploy_time,
            envelope.correlation_or_event_id(),
            envelope.sector_id.clone(),
        );
        Ok(())
    }

    /// Startup recovery: re-enqueue interrupted verifications and backfill
    /// recent deployments that never got a record.
    pub async fn resume_pending(self: &Arc<Self>) -> crate::Result<()> {
        for record in self.records.list_in_progress().await? {
            match FixDetails::from_value(&record.details) {
                Ok(details) => {
                    let deploy_time = Self::deploy_time_of(&details, record.started_at);
                    let sector = sector_of(&details);
                    let correlation = details.correlation_id.clone();
                    info!(fix_id = %details.fix_id, "resuming interrupted verification");
                    self.schedule(details, deploy_time, correlation, sector);
                }
                Err(e) => {
                    warn!(key = %record.key, error = %e, "unreadable verification record, skipping");
                }
            }
        }

        let now = Utc::now();
        let query = EventQuery::new(
            vec![topics::FIX_DEPLOY_SUCCEEDED.to_string()],
            now - Duration::hours(BACKFILL_LOOKBACK_HOURS),
            now,
        );
        for stored in self.events.query(&query).await? {
            let Ok(details) = FixDetails::from_value(&stored.envelope.details) else {
                continue;
            };
            if self.records.get(&details.fix_id).await?.is_some() {
                continue;
            }
            info!(fix_id = %details.fix_id, "backfilling missed verification");
            self.records
                .begin(&details.fix_id, stored.envelope.details.clone())
                .await?;
            let deploy_time = Self::deploy_time_of(&details, stored.envelope.timestamp);
            let correlation = stored.envelope.correlation_or_event_id();
            let sector = stored.envelope.sector_id.clone();
            self.schedule(details, deploy_time, correlation, sector);
        }
        Ok(())
    }

    // -- metric evaluation ---------------------------------------------------

    async fn window_events(
        &self,
        query_topics: Vec<&'static str>,
        field_eq: Option<(String, Value)>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> crate::Result<Vec<StoredEvent>> {
        let mut query = EventQuery::new(
            query_topics.into_iter().map(String::from).collect(),
            since,
            until,
        );
        if let Some((path, value)) = field_eq {
            query = query.with_field_eq(path, value);
        }
        Ok(self.events.query(&query).await?)
    }

    async fn verify_action(
        &self,
        action: &FixAction,
        task: &VerificationTask,
    ) -> ActionVerdict {
        let Some(verification) = &action.verification else {
            return ActionVerdict::Skipped("no verification criteria".to_string());
        };

        let since = task.deploy_time;
        let until = (task.deploy_time + Duration::seconds(verification.window_seconds as i64))
            .min(Utc::now());
        let metric = verification.metric_name.as_str();

        let computed: crate::Result<Option<MetricReading>> = match (&action.action_type, metric) {
            (ActionType::TransitRerouteSim, "delay_reduction") => {
                let filter = action
                    .target
                    .route_id
                    .as_ref()
                    .map(|r| ("details.route_id".to_string(), json!(r)));
                self.window_events(
                    vec![topics::TRANSIT_DISRUPTION_RISK, topics::TRANSIT_HOTSPOT],
                    filter,
                    since,
                    until,
                )
                .await
                .map(|events| Some(metrics::delay_reduction(&events, self.factors.transit)))
            }
            (ActionType::TrafficAdvisorySim, "risk_score_delta") => {
                let sector = action.target.sector_id.clone().unwrap_or_else(|| task.sector.clone());
                self.window_events(
                    vec![topics::GEO_RISK_AREA],
                    Some(("sector_id".to_string(), json!(sector))),
                    since,
                    until,
                )
                .await
                .map(|events| Some(metrics::risk_score_delta(&events, self.factors.traffic)))
            }
            (ActionType::AirspaceMitigationSim, "congestion_score" | "hotspot_congestion") => {
                let sector = action.target.sector_id.clone().unwrap_or_else(|| task.sector.clone());
                self.window_events(
                    vec![topics::AIRSPACE_HOTSPOT_DETECTED],
                    Some(("sector_id".to_string(), json!(sector))),
                    since,
                    until,
                )
                .await
                .map(|events| Some(metrics::congestion_score(&events, self.factors.airspace)))
            }
            (ActionType::PowerRecoverySim, "voltage_stable") => {
                let sector = action.target.sector_id.clone().unwrap_or_else(|| task.sector.clone());
                self.window_events(
                    vec![topics::POWER_FAILURE],
                    Some(("sector_id".to_string(), json!(sector))),
                    since,
                    until,
                )
                .await
                .map(|events| Some(metrics::voltage_stable(&events)))
            }
            _ => Ok(None),
        };

        match computed {
            Ok(Some(reading)) => {
                let polarity = metrics::polarity_for(&reading.metric_name);
                if metrics::passes(polarity, reading.actual, verification.threshold) {
                    ActionVerdict::Passed(reading)
                } else {
                    ActionVerdict::Failed(reading)
                }
            }
            Ok(None) => ActionVerdict::Skipped(format!(
                "no metric rule for {} / {metric}",
                action.action_type
            )),
            // Store trouble is not a verification failure.
            Err(e) => ActionVerdict::Skipped(format!("metric computation error: {e}")),
        }
    }

    // -- the verification pass ----------------------------------------------

    async fn run_verification(&self, task: VerificationTask) {
        if let Err(e) = self.verification_pass(&task).await {
            warn!(fix_id = %task.details.fix_id, error = %e, "verification pass failed");
        }
    }

    async fn verification_pass(&self, task: &VerificationTask) -> crate::Result<()> {
        let details = &task.details;
        let fix_id = &details.fix_id;
        info!(fix_id = %fix_id, "verification started");

        if details.actions.is_empty() {
            self.records
                .append_timeline(fix_id, TimelineEntry::now("skipped", "No actions to verify"))
                .await?;
            self.records
                .complete(fix_id, VerificationStatus::Skipped, vec![], json!({}), None)
                .await?;
            return Ok(());
        }

        let mut results: Vec<Value> = Vec::with_capacity(details.actions.len());
        let mut failed_actions: Vec<Value> = Vec::new();
        let (mut passed, mut failed, mut skipped) = (0usize, 0usize, 0usize);

        for (index, action) in details.actions.iter().enumerate() {
            let verdict = self.verify_action(action, task).await;
            let step = index + 1;
            match verdict {
                ActionVerdict::Passed(reading) => {
                    passed += 1;
                    self.records
                        .append_timeline(
                            fix_id,
                            TimelineEntry::now(
                                "passed",
                                format!("Action {step} passed: {}", reading.metric_name),
                            )
                            .with_data(reading.evidence()),
                        )
                        .await?;
                    results.push(json!({
                        "action_index": step,
                        "action_type": action.action_type.as_str(),
                        "passed": true,
                        "evidence": reading.evidence(),
                    }));
                }
                ActionVerdict::Failed(reading) => {
                    failed += 1;
                    let threshold = action
                        .verification
                        .as_ref()
                        .map(|v| v.threshold)
                        .unwrap_or_default();
                    let error = format!(
                        "metric {} did not meet threshold {threshold}",
                        reading.metric_name
                    );
                    self.records
                        .append_timeline(
                            fix_id,
                            TimelineEntry::now("failed", format!("Action {step} failed: {error}"))
                                .with_data(reading.evidence()),
                        )
                        .await?;
                    let result = json!({
                        "action_index": step,
                        "action_type": action.action_type.as_str(),
                        "passed": false,
                        "error": error,
                        "evidence": reading.evidence(),
                    });
                    failed_actions.push(result.clone());
                    results.push(result);
                }
                ActionVerdict::Skipped(reason) => {
                    skipped += 1;
                    self.records
                        .append_timeline(
                            fix_id,
                            TimelineEntry::now(
                                "skipped",
                                format!("Action {step} skipped: {reason}"),
                            ),
                        )
                        .await?;
                    results.push(json!({
                        "action_index": step,
                        "action_type": action.action_type.as_str(),
                        "passed": true,
                        "skipped": true,
                        "reason": reason,
                    }));
                }
            }
        }

        let summary = json!({
            "total_actions": details.actions.len(),
            "passed": passed,
            "failed": failed,
            "skipped": skipped,
        });

        COUNTERS.inc_verifications_completed();

        if failed == 0 {
            self.records
                .complete(fix_id, VerificationStatus::Verified, results.clone(), summary, None)
                .await?;
            self.publish_verified(task, results).await
        } else {
            let error = format!("{failed} action(s) did not meet criteria");
            self.records
                .complete(
                    fix_id,
                    VerificationStatus::Failed,
                    results.clone(),
                    summary,
                    Some(error.clone()),
                )
                .await?;
            self.publish_rollback_requested(task, results, failed_actions, error)
                .await
        }
    }

    async fn publish_verified(
        &self,
        task: &VerificationTask,
        results: Vec<Value>,
    ) -> crate::Result<()> {
        let mut details = task.details.clone();
        details.verified_at = Some(Utc::now());
        details
            .extra
            .insert("verification_results".to_string(), json!(results));

        let envelope = Envelope::new(
            &self.source_id,
            Severity::Info,
            &task.sector,
            format!("Fix {} verified successfully", details.fix_id),
        )
        .with_correlation(&task.correlation)
        .with_details(details.to_value()?);
        self.bus.publish(topics::FIX_VERIFIED, &envelope).await?;
        info!(fix_id = %details.fix_id, "fix verified");
        Ok(())
    }

    async fn publish_rollback_requested(
        &self,
        task: &VerificationTask,
        results: Vec<Value>,
        failed_actions: Vec<Value>,
        reason: String,
    ) -> crate::Result<()> {
        let mut details = task.details.clone();

        // Reverse the first failed action's target (falling back to the
        // first action overall).
        let failed_index = failed_actions
            .first()
            .and_then(|f| f.get("action_index"))
            .and_then(|v| v.as_u64())
            .map(|i| (i as usize).saturating_sub(1))
            .unwrap_or(0);
        let target = details
            .actions
            .get(failed_index)
            .or_else(|| details.actions.first())
            .map(|a| a.target.clone())
            .unwrap_or_default();

        let rollback_action = FixAction {
            action_type: ActionType::RollbackSim,
            target,
            params: serde_json::Map::from_iter([
                ("original_fix_id".to_string(), json!(details.fix_id)),
                ("reason".to_string(), json!("Verification failed")),
                ("failed_actions".to_string(), json!(failed_actions)),
            ]),
            verification: None,
        };

        details.rollback_reason = Some(reason.clone());
        details
            .extra
            .insert("verification_results".to_string(), json!(results));
        details
            .extra
            .insert("failed_actions".to_string(), json!(failed_actions));
        details.extra.insert(
            "suggested_rollback_action".to_string(),
            serde_json::to_value(&rollback_action).map_err(aegis_domain::DomainError::from)?,
        );

        let envelope = Envelope::new(
            &self.source_id,
            Severity::Warning,
            &task.sector,
            format!(
                "Rollback requested for fix {}: verification failed",
                details.fix_id
            ),
        )
        .with_correlation(&task.correlation)
        .with_details(details.to_value()?);
        self.bus
            .publish(topics::FIX_ROLLBACK_REQUESTED, &envelope)
            .await?;
        warn!(fix_id = %details.fix_id, reason = %reason, "rollback requested");
        Ok(())
    }
}

fn sector_of(details: &FixDetails) -> String {
    details
        .actions
        .iter()
        .find_map(|a| a.target.sector_id.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

#[async_trait]
impl EventHandler for Verifier {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        if let Err(e) = self.on_deploy_succeeded(&envelope).await {
            warn!(topic, error = %e, "verifier handler failed");
        }
    }
}
