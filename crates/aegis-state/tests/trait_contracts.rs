//! Contract tests for the storage traits, run against the in-memory fakes.
//!
//! Any backend implementing these traits must satisfy the same behavior;
//! the fakes are the executable specification.

use chrono::{Duration, Utc};
use serde_json::json;

use aegis_domain::{Envelope, Severity};
use aegis_state::fakes::{MemoryDeploymentStore, MemoryEventStore, MemoryVerificationStore};
use aegis_state::{
    BeginOutcome, DeploymentStatus, DeploymentStore, EventQuery, EventStore, TimelineEntry,
    VerificationStatus, VerificationStore,
};

fn envelope(sector: &str, details: serde_json::Value) -> Envelope {
    Envelope::new("contract-test", Severity::Info, sector, "sample").with_details(details)
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

#[tokio::test]
async fn event_store_appends_and_queries_by_window() {
    let store = MemoryEventStore::new();
    store
        .append("t.a", &envelope("sector-1", json!({})))
        .await
        .unwrap();
    store
        .append("t.b", &envelope("sector-1", json!({})))
        .await
        .unwrap();

    let now = Utc::now();
    let query = EventQuery::new(
        vec!["t.a".to_string()],
        now - Duration::seconds(30),
        now + Duration::seconds(1),
    );
    let results = store.query(&query).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].topic, "t.a");
}

#[tokio::test]
async fn event_store_filters_on_details_fields() {
    let store = MemoryEventStore::new();
    store
        .append("t.a", &envelope("sector-1", json!({"fix_id": "FIX-1"})))
        .await
        .unwrap();
    store
        .append("t.a", &envelope("sector-1", json!({"fix_id": "FIX-2"})))
        .await
        .unwrap();

    let now = Utc::now();
    let query = EventQuery::new(
        vec!["t.a".to_string()],
        now - Duration::seconds(30),
        now + Duration::seconds(1),
    )
    .with_field_eq("details.fix_id", json!("FIX-1"));

    let results = store.query(&query).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].envelope.details["fix_id"], json!("FIX-1"));
}

#[tokio::test]
async fn event_store_results_are_time_ordered() {
    let store = MemoryEventStore::new();
    for i in 0..5 {
        store
            .append("t.a", &envelope("sector-1", json!({"seq": i})))
            .await
            .unwrap();
    }

    let now = Utc::now();
    let query = EventQuery::new(
        vec!["t.a".to_string()],
        now - Duration::seconds(30),
        now + Duration::seconds(1),
    );
    let results = store.query(&query).await.unwrap();
    assert_eq!(results.len(), 5);
    for pair in results.windows(2) {
        assert!(pair[0].received_at <= pair[1].received_at);
    }
}

// ---------------------------------------------------------------------------
// DeploymentStore
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deployment_begin_is_idempotent_while_active() {
    let store = MemoryDeploymentStore::new();

    let first = store.begin("FIX-1", json!({})).await.unwrap();
    assert_eq!(first, BeginOutcome::Fresh);

    // Second arrival while started: caller must not act.
    let second = store.begin("FIX-1", json!({})).await.unwrap();
    assert_eq!(
        second,
        BeginOutcome::AlreadyActive(DeploymentStatus::Started)
    );

    store.complete("FIX-1", vec![json!({"ok": true})]).await.unwrap();

    // Third arrival after success: still a no-op.
    let third = store.begin("FIX-1", json!({})).await.unwrap();
    assert_eq!(
        third,
        BeginOutcome::AlreadyActive(DeploymentStatus::Succeeded)
    );
}

#[tokio::test]
async fn deployment_failed_state_allows_retry() {
    let store = MemoryDeploymentStore::new();
    store.begin("FIX-2", json!({})).await.unwrap();
    store.fail("FIX-2", "action exploded").await.unwrap();

    let record = store.get("FIX-2").await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("action exploded"));

    let retry = store.begin("FIX-2", json!({"attempt": 2})).await.unwrap();
    assert_eq!(retry, BeginOutcome::Retry);

    let record = store.get("FIX-2").await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Started);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn deployment_begin_is_atomic_under_contention() {
    use std::sync::Arc;

    let store = Arc::new(MemoryDeploymentStore::new());
    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.begin("FIX-RACE", json!({})).await.unwrap()
        }));
    }

    let mut startable = 0;
    for handle in handles {
        if handle.await.unwrap() == BeginOutcome::Fresh {
            startable += 1;
        }
    }
    // Exactly one caller may enter the started state.
    assert_eq!(startable, 1);
}

#[tokio::test]
async fn deployment_timeline_is_append_only() {
    let store = MemoryDeploymentStore::new();
    store.begin("FIX-3", json!({})).await.unwrap();
    store
        .append_timeline("FIX-3", TimelineEntry::now("note", "checkpoint"))
        .await
        .unwrap();
    store.complete("FIX-3", vec![]).await.unwrap();

    let record = store.get("FIX-3").await.unwrap().unwrap();
    let statuses: Vec<&str> = record.timeline.iter().map(|e| e.status.as_str()).collect();
    assert_eq!(
        statuses,
        vec!["deployment_started", "note", "deployment_succeeded"]
    );
}

#[tokio::test]
async fn deployment_mutation_requires_record() {
    let store = MemoryDeploymentStore::new();
    assert!(store.complete("FIX-MISSING", vec![]).await.is_err());
    assert!(store.fail("FIX-MISSING", "boom").await.is_err());
    assert!(store.get("FIX-MISSING").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// VerificationStore
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verification_lifecycle_records_timeline() {
    let store = MemoryVerificationStore::new();
    store.begin("FIX-1", json!({"fix_id": "FIX-1"})).await.unwrap();

    let record = store.get("FIX-1").await.unwrap().unwrap();
    assert_eq!(record.status, VerificationStatus::InProgress);
    assert_eq!(record.timeline[0].status, "verification_started");

    store
        .append_timeline("FIX-1", TimelineEntry::now("passed", "Action 1 passed"))
        .await
        .unwrap();
    store
        .complete(
            "FIX-1",
            VerificationStatus::Verified,
            vec![json!({"passed": true})],
            json!({"total_actions": 1, "passed": 1}),
            None,
        )
        .await
        .unwrap();

    let record = store.get("FIX-1").await.unwrap().unwrap();
    assert_eq!(record.status, VerificationStatus::Verified);
    assert!(record.completed_at.is_some());
    assert_eq!(record.results.len(), 1);
    assert_eq!(record.timeline.len(), 3);
}

#[tokio::test]
async fn verification_failure_keeps_error() {
    let store = MemoryVerificationStore::new();
    store.begin("FIX-2", json!({})).await.unwrap();
    store
        .complete(
            "FIX-2",
            VerificationStatus::Failed,
            vec![json!({"passed": false})],
            json!({"total_actions": 1, "failed": 1}),
            Some("delay_reduction below threshold".to_string()),
        )
        .await
        .unwrap();

    let record = store.get("FIX-2").await.unwrap().unwrap();
    assert_eq!(record.status, VerificationStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("delay_reduction"));
}

#[tokio::test]
async fn in_progress_listing_supports_startup_recovery() {
    let store = MemoryVerificationStore::new();
    store.begin("FIX-A", json!({})).await.unwrap();
    store.begin("FIX-B", json!({})).await.unwrap();
    store
        .complete("FIX-B", VerificationStatus::Verified, vec![], json!({}), None)
        .await
        .unwrap();

    let pending = store.list_in_progress().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].key, "FIX-A");
}

#[tokio::test]
async fn verification_begin_resets_completed_record() {
    let store = MemoryVerificationStore::new();
    store.begin("FIX-C", json!({})).await.unwrap();
    store
        .complete("FIX-C", VerificationStatus::Failed, vec![], json!({}), None)
        .await
        .unwrap();

    // Re-verification (e.g. after a retry deployment) restarts the record.
    store.begin("FIX-C", json!({"attempt": 2})).await.unwrap();
    let record = store.get("FIX-C").await.unwrap().unwrap();
    assert_eq!(record.status, VerificationStatus::InProgress);
}
