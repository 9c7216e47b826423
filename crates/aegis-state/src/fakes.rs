//! In-memory fakes for storage traits (testing and single-process demos)
//!
//! Provides `MemoryEventStore`, `MemoryDeploymentStore`, and
//! `MemoryVerificationStore` that satisfy the trait contracts without any
//! external dependencies. The deployment store's `begin` holds a single
//! mutex across the check and the write, which is exactly the atomicity the
//! trait demands.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use aegis_domain::Envelope;

use crate::error::StateError;
use crate::records::*;
use crate::store_traits::*;
use crate::StateResult;

// ---------------------------------------------------------------------------
// MemoryEventStore
// ---------------------------------------------------------------------------

/// In-memory append-only event log.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of logged events (test helper).
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, topic: &str, envelope: &Envelope) -> StateResult<()> {
        let mut events = self.events.lock().unwrap();
        events.push(StoredEvent {
            topic: topic.to_string(),
            envelope: envelope.clone(),
            received_at: Utc::now(),
        });
        Ok(())
    }

    async fn query(&self, query: &EventQuery) -> StateResult<Vec<StoredEvent>> {
        let events = self.events.lock().unwrap();
        let mut matched: Vec<StoredEvent> = events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.received_at);
        Ok(matched)
    }
}

// ---------------------------------------------------------------------------
// MemoryDeploymentStore
// ---------------------------------------------------------------------------

/// In-memory deployment record store.
#[derive(Debug, Default)]
pub struct MemoryDeploymentStore {
    records: Mutex<HashMap<String, DeploymentRecord>>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn begin(&self, key: &str, details: Value) -> StateResult<BeginOutcome> {
        let now = Utc::now();
        // Single lock held across check and write: the atomic
        // check-then-set the trait contract requires.
        let mut records = self.records.lock().unwrap();
        match records.get_mut(key) {
            Some(record) => match record.status {
                DeploymentStatus::Started | DeploymentStatus::Succeeded => {
                    Ok(BeginOutcome::AlreadyActive(record.status))
                }
                DeploymentStatus::Failed => {
                    record.status = DeploymentStatus::Started;
                    record.details = details;
                    record.updated_at = now;
                    record.error = None;
                    record.timeline.push(TimelineEntry::now(
                        "deployment_restarted",
                        "Retrying after previous failure",
                    ));
                    Ok(BeginOutcome::Retry)
                }
            },
            None => {
                records.insert(
                    key.to_string(),
                    DeploymentRecord {
                        key: key.to_string(),
                        status: DeploymentStatus::Started,
                        details,
                        started_at: now,
                        updated_at: now,
                        completed_at: None,
                        actions_executed: Vec::new(),
                        error: None,
                        timeline: vec![TimelineEntry::now(
                            "deployment_started",
                            "Deployment initiated",
                        )],
                    },
                );
                Ok(BeginOutcome::Fresh)
            }
        }
    }

    async fn complete(&self, key: &str, actions_executed: Vec<Value>) -> StateResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(key).ok_or_else(|| StateError::NotFound {
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
        Ok(())
    }

    async fn fail(&self, key: &str, error: &str) -> StateResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(key).ok_or_else(|| StateError::NotFound {
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
        Ok(())
    }

    async fn get(&self, key: &str) -> StateResult<Option<DeploymentRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(key).cloned())
    }

    async fn append_timeline(&self, key: &str, entry: TimelineEntry) -> StateResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(key).ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        record.updated_at = Utc::now();
        record.timeline.push(entry);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryVerificationStore
// ---------------------------------------------------------------------------

/// In-memory verification record store.
#[derive(Debug, Default)]
pub struct MemoryVerificationStore {
    records: Mutex<HashMap<String, VerificationRecord>>,
}

impl MemoryVerificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VerificationStore for MemoryVerificationStore {
    async fn begin(&self, key: &str, details: Value) -> StateResult<()> {
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let entry = TimelineEntry::now("verification_started", "Verification process initiated");
        match records.get_mut(key) {
            Some(record) => {
                record.status = VerificationStatus::InProgress;
                record.details = details;
                record.updated_at = now;
                record.timeline.push(entry);
            }
            None => {
                records.insert(
                    key.to_string(),
                    VerificationRecord {
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
                    },
                );
            }
        }
        Ok(())
    }

    async fn append_timeline(&self, key: &str, entry: TimelineEntry) -> StateResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(key).ok_or_else(|| StateError::NotFound {
            key: key.to_string(),
        })?;
        record.updated_at = Utc::now();
        record.timeline.push(entry);
        Ok(())
    }

    async fn complete(
        &self,
        key: &str,
        status: VerificationStatus,
        results: Vec<Value>,
        metrics: Value,
        error: Option<String>,
    ) -> StateResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(key).ok_or_else(|| StateError::NotFound {
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
        Ok(())
    }

    async fn get(&self, key: &str) -> StateResult<Option<VerificationRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(key).cloned())
    }

    async fn list_in_progress(&self) -> StateResult<Vec<VerificationRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| r.status == VerificationStatus::InProgress)
            .cloned()
            .collect())
    }
}
