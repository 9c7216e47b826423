//! End-to-end fix lifecycle over the in-memory bus and stores.
//!
//! Covers the full path from a critical trigger through proposal, review,
//! actuation, verification, and rollback, plus the actuator's idempotency
//! and unknown-action handling.

mod support;

use std::time::Duration;

use serde_json::json;

use aegis_bus::MessageBus;
use aegis_core::AutonomyLevel;
use aegis_domain::fix::{ActionType, FixAction, FixDetails, RiskLevel};
use aegis_domain::{topics, Envelope, Severity};
use aegis_state::{DeploymentStatus, DeploymentStore, VerificationStore};

use support::{fix_with_action, power_action, start_engine, transit_action, Probe};

const WAIT: Duration = Duration::from_secs(5);

fn critical_power_failure(sector: &str) -> Envelope {
    Envelope::new(
        "power-monitor",
        Severity::Critical,
        sector,
        "Complete power failure detected",
    )
    .with_details(json!({"voltage": 0, "load": 100, "phase": "all"}))
}

fn deploy_request(details: &FixDetails) -> Envelope {
    Envelope::new(
        "test-driver",
        Severity::Warning,
        "sector-1",
        format!("Deployment requested for fix {}", details.fix_id),
    )
    .with_correlation(&details.correlation_id)
    .with_details(details.to_value().unwrap())
}

// NORMAL autonomy: approval, deployment, successful verification.
#[tokio::test]
async fn normal_autonomy_full_lifecycle_verifies() {
    let harness = start_engine(0, 0, AutonomyLevel::Normal).await;
    let probe = Probe::attach(
        &harness.bus,
        &[
            topics::FIX_PROPOSED,
            topics::FIX_REVIEW_REQUIRED,
            topics::FIX_APPROVED,
            topics::FIX_DEPLOY_REQUESTED,
            topics::FIX_DEPLOY_STARTED,
            topics::FIX_DEPLOY_SUCCEEDED,
            topics::FIX_VERIFIED,
            topics::SYSTEM_ACTION,
        ],
    )
    .await;

    harness
        .bus
        .publish(topics::POWER_FAILURE, &critical_power_failure("sector-1"))
        .await
        .unwrap();

    let proposed = probe.wait_for(topics::FIX_PROPOSED, WAIT).await;
    let details = FixDetails::from_value(&proposed.details).unwrap();
    assert_eq!(details.risk_level, RiskLevel::Med);
    assert!(details.requires_human_approval);
    assert!(details.actions.iter().any(|a| a.verification.is_some()));

    let review = probe.wait_for(topics::FIX_REVIEW_REQUIRED, WAIT).await;
    assert_eq!(
        review.details["fix_id"].as_str(),
        Some(details.fix_id.as_str())
    );

    // Let the event logger catch up before the gate consults the store.
    Probe::settle().await;

    let decision = Envelope::new(
        "operator-console",
        Severity::Info,
        "sector-1",
        format!("Approve fix {}", details.fix_id),
    )
    .with_details(json!({
        "fix_id": details.fix_id,
        "approve": true,
        "reviewer": "op-7",
        "notes": "looks safe",
    }));
    harness
        .bus
        .publish(topics::FIX_REVIEW_DECISION, &decision)
        .await
        .unwrap();

    let approved = probe.wait_for(topics::FIX_APPROVED, WAIT).await;
    assert_eq!(approved.details["approved_by"].as_str(), Some("op-7"));

    probe.wait_for(topics::FIX_DEPLOY_REQUESTED, WAIT).await;
    probe.wait_for(topics::FIX_DEPLOY_STARTED, WAIT).await;
    probe.wait_for(topics::FIX_DEPLOY_SUCCEEDED, WAIT).await;

    // The power-recovery simulation landed on system.action with both
    // sandbox markers.
    let simulations: Vec<Envelope> = probe
        .all(topics::SYSTEM_ACTION)
        .into_iter()
        .filter(|e| e.details["action_type"] == json!("power-recovery-sim"))
        .collect();
    assert!(!simulations.is_empty());
    for simulation in &simulations {
        assert!(simulation.is_sandboxed(), "missing sandbox markers");
    }

    // Zero-length window and no further power failures: verified.
    let verified = probe.wait_for(topics::FIX_VERIFIED, WAIT).await;
    assert_eq!(
        verified.details["fix_id"].as_str(),
        Some(details.fix_id.as_str())
    );
    assert_eq!(verified.correlation_id, proposed.correlation_id);

    let record = harness
        .fix_verifications
        .get(&details.fix_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        record.status,
        aegis_state::VerificationStatus::Verified
    );
}

// Actuator idempotency: two deploy requests, one deployment.
#[tokio::test]
async fn duplicate_deploy_requests_deploy_once() {
    let harness = start_engine(0, 0, AutonomyLevel::Normal).await;
    let probe = Probe::attach(
        &harness.bus,
        &[topics::FIX_DEPLOY_STARTED, topics::FIX_DEPLOY_SUCCEEDED],
    )
    .await;

    let details = fix_with_action(power_action("sector-2", 0));
    let request = deploy_request(&details);

    harness
        .bus
        .publish(topics::FIX_DEPLOY_REQUESTED, &request)
        .await
        .unwrap();
    harness
        .bus
        .publish(topics::FIX_DEPLOY_REQUESTED, &request)
        .await
        .unwrap();

    probe.wait_for(topics::FIX_DEPLOY_SUCCEEDED, WAIT).await;
    Probe::settle().await;

    assert_eq!(probe.count(topics::FIX_DEPLOY_STARTED), 1);
    assert_eq!(probe.count(topics::FIX_DEPLOY_SUCCEEDED), 1);

    let record = harness
        .fix_deployments
        .get(&details.fix_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DeploymentStatus::Succeeded);
}

// Verifier rollback: delays stay high, rollback carries the original
// target, and the actuator completes it.
#[tokio::test]
async fn failed_verification_requests_rollback() {
    let harness = start_engine(0, 0, AutonomyLevel::Normal).await;
    let probe = Probe::attach(
        &harness.bus,
        &[
            topics::TRANSIT_MITIGATION_APPLIED,
            topics::FIX_DEPLOY_SUCCEEDED,
            topics::FIX_ROLLBACK_REQUESTED,
            topics::FIX_ROLLBACK_SUCCEEDED,
        ],
    )
    .await;

    // One-second window so the injected delays land inside it.
    let details = fix_with_action(transit_action("ROUTE-95", 10.0, 1));
    harness
        .bus
        .publish(topics::FIX_DEPLOY_REQUESTED, &deploy_request(&details))
        .await
        .unwrap();

    probe.wait_for(topics::FIX_DEPLOY_SUCCEEDED, WAIT).await;

    // The reroute simulation landed with its sandbox markers.
    let mitigation = probe.wait_for(topics::TRANSIT_MITIGATION_APPLIED, WAIT).await;
    assert!(mitigation.is_sandboxed());
    assert_eq!(mitigation.details["route_id"].as_str(), Some("ROUTE-95"));

    // Average delay 10 -> claimed baseline 15 -> reduction 5 < threshold 10.
    for _ in 0..2 {
        let disruption = Envelope::new(
            "transit-monitor",
            Severity::Warning,
            "sector-1",
            "Route 95 still delayed",
        )
        .with_details(json!({"route_id": "ROUTE-95", "delay": 10.0}));
        harness
            .bus
            .publish(topics::TRANSIT_DISRUPTION_RISK, &disruption)
            .await
            .unwrap();
    }

    let rollback = probe
        .wait_for(topics::FIX_ROLLBACK_REQUESTED, Duration::from_secs(10))
        .await;
    let suggested: FixAction = serde_json::from_value(
        rollback.details["suggested_rollback_action"].clone(),
    )
    .unwrap();
    assert_eq!(suggested.action_type, ActionType::RollbackSim);
    assert_eq!(suggested.target.route_id.as_deref(), Some("ROUTE-95"));

    // The actuator executes the rollback and closes the lifecycle.
    let done = probe
        .wait_for(topics::FIX_ROLLBACK_SUCCEEDED, Duration::from_secs(10))
        .await;
    assert_eq!(
        done.details["fix_id"].as_str(),
        Some(details.fix_id.as_str())
    );
}

// HIGH autonomy: recovery plans execute without approval, and fixes
// skip human review.
#[tokio::test]
async fn high_autonomy_skips_approval() {
    let harness = start_engine(0, 0, AutonomyLevel::Normal).await;
    let probe = Probe::attach(
        &harness.bus,
        &[
            topics::AUDIT_DECISION,
            topics::SYSTEM_ACTION,
            topics::APPROVAL_REQUIRED,
            topics::FIX_APPROVED,
            topics::FIX_REVIEW_REQUIRED,
            topics::FIX_DEPLOY_REQUESTED,
        ],
    )
    .await;

    let status = Envelope::new(
        "operator-console",
        Severity::Info,
        "sector-1",
        "Operator raised autonomy",
    )
    .with_details(json!({
        "autonomy_level": "HIGH",
        "operator_id": "op-7",
        "operator_name": "Operator Seven",
    }));
    harness
        .bus
        .publish(topics::OPERATOR_STATUS, &status)
        .await
        .unwrap();
    Probe::settle().await;

    let plan = Envelope::new(
        "recovery-planner",
        Severity::Warning,
        "sector-1",
        "Recovery plan ready",
    )
    .with_details(json!({
        "plan_id": "RP-2026-0A1",
        "plan_name": "Sector 1 Restoration",
        "status": "active",
    }));
    harness
        .bus
        .publish(topics::RECOVERY_PLAN, &plan)
        .await
        .unwrap();

    let audit = probe.wait_for(topics::AUDIT_DECISION, WAIT).await;
    assert_eq!(audit.details["decision_type"].as_str(), Some("automated"));
    assert_eq!(audit.details["outcome"].as_str(), Some("pending"));

    let action = probe.wait_for(topics::SYSTEM_ACTION, WAIT).await;
    assert_eq!(action.details["status"].as_str(), Some("executing"));

    Probe::settle().await;
    assert_eq!(probe.count(topics::APPROVAL_REQUIRED), 0);

    // A critical event under HIGH autonomy auto-approves its fix.
    harness
        .bus
        .publish(topics::POWER_FAILURE, &critical_power_failure("sector-3"))
        .await
        .unwrap();

    let approved = probe.wait_for(topics::FIX_APPROVED, WAIT).await;
    assert_eq!(
        approved.details["approved_by"].as_str(),
        Some("autonomy-router-001")
    );
    probe.wait_for(topics::FIX_DEPLOY_REQUESTED, WAIT).await;
    Probe::settle().await;
    assert_eq!(probe.count(topics::FIX_REVIEW_REQUIRED), 0);
}

// An unknown action type ends the lifecycle with an explicit failure.
#[tokio::test]
async fn unknown_action_type_fails_deployment() {
    let harness = start_engine(0, 0, AutonomyLevel::Normal).await;
    let probe = Probe::attach(
        &harness.bus,
        &[topics::FIX_DEPLOY_STARTED, topics::FIX_DEPLOY_FAILED],
    )
    .await;

    let details = fix_with_action(FixAction {
        action_type: ActionType::from_wire("quantum-entangle-sim"),
        target: Default::default(),
        params: Default::default(),
        verification: None,
    });
    harness
        .bus
        .publish(topics::FIX_DEPLOY_REQUESTED, &deploy_request(&details))
        .await
        .unwrap();

    let failed = probe.wait_for(topics::FIX_DEPLOY_FAILED, WAIT).await;
    assert!(failed.details["error"]
        .as_str()
        .unwrap()
        .contains("quantum-entangle-sim"));

    let record = harness
        .fix_deployments
        .get(&details.fix_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.error.unwrap().contains("quantum-entangle-sim"));
}

// Correlation closure: every lifecycle event of one fix shares one
// correlation id.
#[tokio::test]
async fn lifecycle_events_share_correlation() {
    let harness = start_engine(0, 0, AutonomyLevel::High).await;
    let probe = Probe::attach(
        &harness.bus,
        &[
            topics::FIX_PROPOSED,
            topics::FIX_DEPLOY_REQUESTED,
            topics::FIX_DEPLOY_SUCCEEDED,
            topics::FIX_VERIFIED,
        ],
    )
    .await;

    let trigger = critical_power_failure("sector-9").with_correlation("INC-CHAIN-1");
    harness
        .bus
        .publish(topics::POWER_FAILURE, &trigger)
        .await
        .unwrap();

    let verified = probe.wait_for(topics::FIX_VERIFIED, Duration::from_secs(10)).await;
    assert_eq!(verified.correlation_id.as_deref(), Some("INC-CHAIN-1"));

    for topic in [
        topics::FIX_PROPOSED,
        topics::FIX_DEPLOY_REQUESTED,
        topics::FIX_DEPLOY_SUCCEEDED,
    ] {
        let events = probe.all(topic);
        assert!(!events.is_empty(), "missing {topic}");
        for event in events {
            assert_eq!(event.correlation_id.as_deref(), Some("INC-CHAIN-1"));
        }
    }
}
