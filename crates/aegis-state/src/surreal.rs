//! SurrealDB-backed storage implementations
//!
//! One connection feeds all stores; the deployment/verification stores are
//! parameterized by table so the fix pipeline and the defense sub-chain get
//! separate collections (`fix_deployments` / `defense_deployments`, etc.)
//! while sharing the implementation.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use aegis_domain::Envelope;

use crate::error::StateError;
use crate::records::*;
use crate::store_traits::*;
use crate::StateResult;

/// Table names for the fix pipeline
pub const FIX_DEPLOYMENTS: &str = "fix_deployments";
pub const FIX_VERIFICATIONS: &str = "fix_verifications";
/// Table names for the defense sub-chain
pub const DEFENSE_DEPLOYMENTS: &str = "defense_deployments";
pub const DEFENSE_VERIFICATIONS: &str = "defense_verifications";

/// Connect to SurrealDB and initialize the schema.
///
/// `url` accepts anything `surrealdb::engine::any` understands
/// (`mem://`, `surrealkv://path`, `ws://host:port`).
pub async fn connect(url: &str) -> StateResult<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("{url}: {e}")))?;

    db.use_ns("aegis")
        .use_db("main")
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    init_schema(&db).await?;
    info!(url, "connected to SurrealDB");
    Ok(db)
}

/// Define tables and the indexes consulted by verifiers and idempotency
/// checks.
async fn init_schema(db: &Surreal<Any>) -> StateResult<()> {
    debug!("initializing aegis schema");

    let schema = r#"
        -- Raw event log
        DEFINE TABLE IF NOT EXISTS events SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_events_topic ON events FIELDS topic;
        DEFINE INDEX IF NOT EXISTS idx_events_received ON events FIELDS received_at;
        DEFINE INDEX IF NOT EXISTS idx_events_topic_received ON events FIELDS topic, received_at;
        DEFINE INDEX IF NOT EXISTS idx_events_correlation ON events FIELDS envelope.correlation_id;
        DEFINE INDEX IF NOT EXISTS idx_events_fix_id ON events FIELDS envelope.details.fix_id;
        DEFINE INDEX IF NOT EXISTS idx_events_threat_id ON events FIELDS envelope.details.threat_id;

        -- Fix pipeline records
        DEFINE TABLE IF NOT EXISTS fix_deployments SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_fix_deployments_key ON fix_deployments FIELDS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_fix_deployments_status ON fix_deployments FIELDS status;
        DEFINE INDEX IF NOT EXISTS idx_fix_deployments_started ON fix_deployments FIELDS started_at;

        DEFINE TABLE IF NOT EXISTS fix_verifications SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_fix_verifications_key ON fix_verifications FIELDS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_fix_verifications_status ON fix_verifications FIELDS status;
        DEFINE INDEX IF NOT EXISTS idx_fix_verifications_started ON fix_verifications FIELDS started_at;

        -- Defense sub-chain records
        DEFINE TABLE IF NOT EXISTS defense_deployments SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_defense_deployments_key ON defense_deployments FIELDS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_defense_deployments_status ON defense_deployments FIELDS status;

        DEFINE TABLE IF NOT EXISTS defense_verifications SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_defense_verifications_key ON defense_verifications FIELDS key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_defense_verifications_status ON defense_verifications FIELDS status;
    "#;

    db.query(schema)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

    debug!("schema initialized");
    Ok(())
}

// ---------------------------------------------------------------------------
// SurrealEventStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`EventStore`].
pub struct SurrealEventStore {
    db: Surreal<Any>,
}

impl SurrealEventStore {
    pub fn new(db: Surreal<Any>) -> Self {
        SurrealEventStore { db }
    }
}

#[async_trait]
impl EventStore for SurrealEventStore {
    async fn append(&self, topic: &str, envelope: &Envelope) -> StateResult<()> {
        let row = StoredEvent {
            topic: topic.to_string(),
            envelope: envelope.clone(),
            received_at: Utc::now(),
        };

        let _created: Option<StoredEvent> = self
            .db
            .create("events")
            .content(row)
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;

        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> StateResult<Vec<StoredEvent>> {
        // Topic and window narrow the scan via indexes; the exact filter
        // (including the optional field equality) is re-applied in Rust so
        // both backends share one matching semantics. The SQL bounds are
        // padded by a second on each side: stored timestamps and bound
        // strings can render RFC 3339 with different precision, and a
        // boundary-instant row must reach the exact filter.
        let topics = query.topics.clone();
        let since = (query.since - chrono::Duration::seconds(1)).to_rfc3339();
        let until = (query.until + chrono::Duration::seconds(1)).to_rfc3339();

        let mut res = self
            .db
            .query(
                "SELECT * FROM events WHERE topic IN $topics \
                 AND received_at >= $since AND received_at <= $until \
                 ORDER BY received_at ASC",
            )
            .bind(("topics", topics))
            .bind(("since", since))
            .bind(("until", until))
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;

        let rows: Vec<StoredEvent> = res.take(0).map_err(|e| StateError::Query(e.to_string()))?;

        let mut matched: Vec<StoredEvent> =
            rows.into_iter().filter(|e| query.matches(e)).collect();
        matched.sort_by_key(|e| e.received_at);
        Ok(matched)
    }
}

// ---------------------------------------------------------------------------
// SurrealDeploymentStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`DeploymentStore`].
pub struct SurrealDeploymentStore {
    db: Surreal<Any>,
    table: &'static str,
}

impl SurrealDeploymentStore {
    /// Store for the fix pipeline (keyed by `fix_id`).
    pub fn fix(db: Surreal<Any>) -> Self {
        SurrealDeploymentStore {
            db,
            table: FIX_DEPLOYMENTS,
        }
    }

    /// Store for the defense sub-chain (keyed by `action_id`).
    pub fn defense(db: Surreal<Any>) -> Self {
        SurrealDeploymentStore {
            db,
            table: DEFENSE_DEPLOYMENTS,
        }
    }

    async fn fetch(&self, key: &str) -> StateResult<Option<DeploymentRecord>> {
        let key_owned = key.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM type::table($table) WHERE key = $key")
            .bind(("table", self.table))
            .bind(("key", key_owned))
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;

        let rows: Vec<DeploymentRecord> =
            res.take(0).map_err(|e| StateError::Query(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn update(&self, key: &str, record: DeploymentRecord) -> StateResult<()> {
        let key_owned = key.to_string();
        self.db
            .query("UPDATE type::table($table) CONTENT $row WHERE key = $key")
            .bind(("table", self.table))
            .bind(("row", record))
            .bind(("key", key_owned))
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for SurrealDeploymentStore {
    async fn begin(&self, key: &str, details: Value) -> StateResult<BeginOutcome> {
        let now = Utc::now();

        // Each step below is one atomic statement, so the check and the
        // write never straddle an await: the conditional UPDATE only
        // matches a failed record, and the unique index on `key` rejects a
        // racing CREATE. A bounded second pass resolves the losing side of
        // either race.
        for _ in 0..2 {
            // Retry flip. Resets the record and appends the restart entry
            // in the same statement, keeping the timeline append-only in
            // lockstep with the in-memory backend.
            let key_owned = key.to_string();
            let restart_entry =
                TimelineEntry::now("deployment_restarted", "Retrying after previous failure");
            let mut res = self
                .db
                .query(
                    "UPDATE type::table($table) \
                     SET status = 'started', details = $details, updated_at = $now, \
                         error = NONE, timeline += $entry \
                     WHERE key = $key AND status = 'failed'",
                )
                .bind(("table", self.table))
                .bind(("key", key_owned))
                .bind(("details", details.clone()))
                .bind(("now", now))
                .bind(("entry", restart_entry))
                .await
                .map_err(|e| StateError::Query(e.to_string()))?;
            let restarted: Vec<DeploymentRecord> =
                res.take(0).map_err(|e| StateError::Query(e.to_string()))?;
            if !restarted.is_empty() {
                return Ok(BeginOutcome::Retry);
            }

            match self.fetch(key).await? {
                Some(record) if record.status != DeploymentStatus::Failed => {
                    return Ok(BeginOutcome::AlreadyActive(record.status));
                }
                // Flipped to failed between the two statements; take the
                // retry path on the next pass.
                Some(_) => continue,
                None => {}
            }

            let fresh = DeploymentRecord {
                key: key.to_string(),
                status: DeploymentStatus::Started,
                details: details.clone(),
                started_at: now,
                updated_at: now,
                completed_at: None,
                actions_executed: Vec::new(),
                error: None,
                timeline: vec![TimelineEntry::now("deployment_started", "Deployment initiated")],
            };
            match self.db.create(self.table).content(fresh).await {
                Ok(created) => {
                    let _: Option<DeploymentRecord> = created;
                    return Ok(BeginOutcome::Fresh);
                }
                Err(e) => {
                    // A concurrent create won the unique index; re-read on
                    // the next pass. Anything else is a real backend error.
                    if self.fetch(key).await?.is_none() {
                        return Err(StateError::Query(e.to_string()));
                    }
                }
            }
        }

        Err(StateError::Query(format!(
            "begin contention not resolved for {key}"
        )))
    }

    async fn complete(&self, key: &str, actions_executed: Vec<Value>) -> StateResult<()> {
        let mut record = self.fetch(key).await?.ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        let now = Utc::now();
        record.status = DeploymentStatus::Succeeded;
        record.actions_executed = actions_executed;
        record.completed_at = Some(now);
        record.updated_at = now;
        record
            .timeline
            .push(TimelineEntry::now("deployment_succeeded", "All actions executed"));
        self.update(key, record).await
    }

    async fn fail(&self, key: &str, error: &str) -> StateResult<()> {
        let mut record = self.fetch(key).await?.ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        let now = Utc::now();
        record.status = DeploymentStatus::Failed;
        record.error = Some(error.to_string());
        record.completed_at = Some(now);
        record.updated_at = now;
        record
            .timeline
            .push(TimelineEntry::now("deployment_failed", error));
        self.update(key, record).await
    }

    async fn get(&self, key: &str) -> StateResult<Option<DeploymentRecord>> {
        self.fetch(key).await
    }

    async fn append_timeline(&self, key: &str, entry: TimelineEntry) -> StateResult<()> {
        let mut record = self.fetch(key).await?.ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        record.updated_at = Utc::now();
        record.timeline.push(entry);
        self.update(key, record).await
    }
}

// ---------------------------------------------------------------------------
// SurrealVerificationStore
// ---------------------------------------------------------------------------

/// SurrealDB-backed implementation of [`VerificationStore`].
pub struct SurrealVerificationStore {
    db: Surreal<Any>,
    table: &'static str,
}

impl SurrealVerificationStore {
    /// Store for the fix pipeline (keyed by `fix_id`).
    pub fn fix(db: Surreal<Any>) -> Self {
        SurrealVerificationStore {
            db,
            table: FIX_VERIFICATIONS,
        }
    }

    /// Store for the defense sub-chain (keyed by `threat_id`).
    pub fn defense(db: Surreal<Any>) -> Self {
        SurrealVerificationStore {
            db,
            table: DEFENSE_VERIFICATIONS,
        }
    }

    async fn fetch(&self, key: &str) -> StateResult<Option<VerificationRecord>> {
        let key_owned = key.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM type::table($table) WHERE key = $key")
            .bind(("table", self.table))
            .bind(("key", key_owned))
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;

        let rows: Vec<VerificationRecord> =
            res.take(0).map_err(|e| StateError::Query(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn update(&self, key: &str, record: VerificationRecord) -> StateResult<()> {
        let key_owned = key.to_string();
        self.db
            .query("UPDATE type::table($table) CONTENT $row WHERE key = $key")
            .bind(("table", self.table))
            .bind(("row", record))
            .bind(("key", key_owned))
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl VerificationStore for SurrealVerificationStore {
    async fn begin(&self, key: &str, details: Value) -> StateResult<()> {
        let now = Utc::now();
        let entry = TimelineEntry::now("verification_started", "Verification process initiated");
        match self.fetch(key).await? {
            Some(mut record) => {
                record.status = VerificationStatus::InProgress;
                record.details = details;
                record.updated_at = now;
                record.timeline.push(entry);
                self.update(key, record).await
            }
            None => {
                let record = VerificationRecord {
                    key: key.to_string(),
                    status: VerificationStatus::InProgress,
                    details,
                    started_at: now,
                    updated_at: now,
                    completed_at: None,
                    results: Vec::new(),
                    metrics: None,
                    error: None,
                    timeline: vec![entry],
                };
                let _created: Option<VerificationRecord> = self
                    .db
                    .create(self.table)
                    .content(record)
                    .await
                    .map_err(|e| StateError::Query(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn append_timeline(&self, key: &str, entry: TimelineEntry) -> StateResult<()> {
        let mut record = self.fetch(key).await?.ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        record.updated_at = Utc::now();
        record.timeline.push(entry);
        self.update(key, record).await
    }

    async fn complete(
        &self,
        key: &str,
        status: VerificationStatus,
        results: Vec<Value>,
        metrics: Value,
        error: Option<String>,
    ) -> StateResult<()> {
        let mut record = self.fetch(key).await?.ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        let now = Utc::now();
        record.status = status;
        record.results = results;
        record.metrics = Some(metrics);
        record.error = error;
        record.completed_at = Some(now);
        record.updated_at = now;
        record.timeline.push(TimelineEntry::now(
            status.as_str(),
            format!("Verification finished: {status}"),
        ));
        self.update(key, record).await
    }

    async fn get(&self, key: &str) -> StateResult<Option<VerificationRecord>> {
        self.fetch(key).await
    }

    async fn list_in_progress(&self) -> StateResult<Vec<VerificationRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM type::table($table) WHERE status = 'in_progress'")
            .bind(("table", self.table))
            .await
            .map_err(|e| StateError::Query(e.to_string()))?;

        let rows: Vec<VerificationRecord> =
            res.take(0).map_err(|e| StateError::Query(e.to_string()))?;
        Ok(rows)
    }
}
