//! Storage trait definitions for Aegis
//!
//! These traits define the persistence abstractions:
//! - `EventStore`: append-only event log with time-windowed queries
//! - `DeploymentStore`: keyed deployment records with an atomic `begin`
//! - `VerificationStore`: keyed verification records with timelines
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use aegis_domain::Envelope;

use crate::records::{DeploymentRecord, DeploymentStatus, TimelineEntry, VerificationRecord, VerificationStatus};
use crate::StateResult;

// ---------------------------------------------------------------------------
// EventStore - append-only event log
// ---------------------------------------------------------------------------

/// One logged bus message.
///
/// `received_at` is the store's own clock, always UTC; windowed queries
/// filter on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub topic: String,
    pub envelope: Envelope,
    pub received_at: DateTime<Utc>,
}

/// Query contract used by verifiers: all events whose topic is in `topics`
/// and whose `received_at` falls in `[since, until]`, optionally filtered by
/// an equality on a dot path into the envelope JSON (e.g. `sector_id` or
/// `details.route_id`).
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub topics: Vec<String>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub field_eq: Option<(String, Value)>,
}

impl EventQuery {
    pub fn new(topics: Vec<String>, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        EventQuery {
            topics,
            since,
            until,
            field_eq: None,
        }
    }

    pub fn with_field_eq(mut self, path: impl Into<String>, value: Value) -> Self {
        self.field_eq = Some((path.into(), value));
        self
    }

    /// Whether a stored event matches this query. Shared by backends so the
    /// filter semantics cannot drift between them.
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if !self.topics.iter().any(|t| t == &event.topic) {
            return false;
        }
        if event.received_at < self.since || event.received_at > self.until {
            return false;
        }
        if let Some((path, expected)) = &self.field_eq {
            let root = match serde_json::to_value(&event.envelope) {
                Ok(v) => v,
                Err(_) => return false,
            };
            return lookup_path(&root, path) == Some(expected);
        }
        true
    }
}

/// Resolve a dot-separated path inside a JSON value.
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Append-only log of every bus message.
///
/// Guarantees:
/// - Events are immutable once appended.
/// - Query results are ordered by `received_at` ascending.
/// - Timestamps returned are timezone-aware UTC, regardless of backend.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one message to the log.
    async fn append(&self, topic: &str, envelope: &Envelope) -> StateResult<()>;

    /// Run a windowed query (see [`EventQuery`]).
    async fn query(&self, query: &EventQuery) -> StateResult<Vec<StoredEvent>>;
}

// ---------------------------------------------------------------------------
// DeploymentStore - keyed deployment records
// ---------------------------------------------------------------------------

/// Result of the atomic begin (check-then-set) on a deployment key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// No record existed; a fresh `started` record was written
    Fresh,
    /// Previous attempt failed; the record was reset to `started`
    Retry,
    /// A deployment is already `started` or `succeeded` - caller must not
    /// act (idempotent no-op)
    AlreadyActive(DeploymentStatus),
}

/// Keyed deployment record store.
///
/// Guarantees:
/// - `begin` is atomic: two concurrent calls for the same key can never
///   both observe `Fresh`/`Retry`. This is the locking contract the
///   actuator's idempotency depends on; there is no await point between
///   the status check and the status write inside any implementation.
/// - Timeline entries are append-only.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Atomically check-then-set the record to `started`. See
    /// [`BeginOutcome`] for the three possible results.
    async fn begin(&self, key: &str, details: Value) -> StateResult<BeginOutcome>;

    /// Mark the deployment succeeded with per-action results.
    async fn complete(&self, key: &str, actions_executed: Vec<Value>) -> StateResult<()>;

    /// Mark the deployment failed with an aggregated error.
    async fn fail(&self, key: &str, error: &str) -> StateResult<()>;

    /// Fetch a record by key.
    async fn get(&self, key: &str) -> StateResult<Option<DeploymentRecord>>;

    /// Append a timeline entry to an existing record.
    async fn append_timeline(&self, key: &str, entry: TimelineEntry) -> StateResult<()>;
}

// ---------------------------------------------------------------------------
// VerificationStore - keyed verification records
// ---------------------------------------------------------------------------

/// Keyed verification record store.
///
/// Guarantees:
/// - `begin` upserts the record to `in_progress` with a
///   `verification_started` timeline entry.
/// - `complete` is terminal for a key (later `begin` restarts it).
/// - Timeline entries are append-only.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    /// Upsert the record to `in_progress`.
    async fn begin(&self, key: &str, details: Value) -> StateResult<()>;

    /// Append a timeline entry to an existing record.
    async fn append_timeline(&self, key: &str, entry: TimelineEntry) -> StateResult<()>;

    /// Record the terminal outcome with per-action results and aggregated
    /// metrics.
    async fn complete(
        &self,
        key: &str,
        status: VerificationStatus,
        results: Vec<Value>,
        metrics: Value,
        error: Option<String>,
    ) -> StateResult<()>;

    /// Fetch a record by key.
    async fn get(&self, key: &str) -> StateResult<Option<VerificationRecord>>;

    /// All records still `in_progress` (startup recovery).
    async fn list_in_progress(&self) -> StateResult<Vec<VerificationRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_domain::Severity;
    use chrono::Duration;
    use serde_json::json;

    fn stored(topic: &str, sector: &str, age_secs: i64) -> StoredEvent {
        let envelope = Envelope::new("test", Severity::Info, sector, "s")
            .with_details(json!({"route_id": "ROUTE-95"}));
        StoredEvent {
            topic: topic.to_string(),
            envelope,
            received_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn query_matches_topic_and_window() {
        let now = Utc::now();
        let query = EventQuery::new(
            vec!["t.a".to_string()],
            now - Duration::seconds(60),
            now,
        );
        assert!(query.matches(&stored("t.a", "sector-1", 30)));
        assert!(!query.matches(&stored("t.b", "sector-1", 30)));
        assert!(!query.matches(&stored("t.a", "sector-1", 120)));
    }

    #[test]
    fn query_field_filter_walks_paths() {
        let now = Utc::now();
        let base = EventQuery::new(
            vec!["t.a".to_string()],
            now - Duration::seconds(60),
            now,
        );

        let by_sector = base
            .clone()
            .with_field_eq("sector_id", json!("sector-1"));
        assert!(by_sector.matches(&stored("t.a", "sector-1", 10)));
        assert!(!by_sector.matches(&stored("t.a", "sector-2", 10)));

        let by_route = base.with_field_eq("details.route_id", json!("ROUTE-95"));
        assert!(by_route.matches(&stored("t.a", "sector-1", 10)));
    }
}
