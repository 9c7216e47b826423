//! Canonical bus topic names
//!
//! All topics live under one root prefix and are defined here in one place.
//! Groupings at the bottom drive subscription sets: the fix proposer watches
//! every non-fix topic, the state logger watches everything.

/// Root prefix for every Aegis topic
pub const TOPIC_PREFIX: &str = "aegis.events.";

// ============================================================================
// FIX LIFECYCLE
// ============================================================================

pub const FIX_PROPOSED: &str = "aegis.events.fix.proposed";
pub const FIX_REVIEW_REQUIRED: &str = "aegis.events.fix.review_required";
/// Control-plane input: a human review decision (approve/reject) for a fix
pub const FIX_REVIEW_DECISION: &str = "aegis.events.fix.review.decision";
pub const FIX_APPROVED: &str = "aegis.events.fix.approved";
pub const FIX_REJECTED: &str = "aegis.events.fix.rejected";
pub const FIX_DEPLOY_REQUESTED: &str = "aegis.events.fix.deploy_requested";
pub const FIX_DEPLOY_STARTED: &str = "aegis.events.fix.deploy_started";
pub const FIX_DEPLOY_SUCCEEDED: &str = "aegis.events.fix.deploy_succeeded";
pub const FIX_DEPLOY_FAILED: &str = "aegis.events.fix.deploy_failed";
pub const FIX_VERIFIED: &str = "aegis.events.fix.verified";
pub const FIX_ROLLBACK_REQUESTED: &str = "aegis.events.fix.rollback_requested";
pub const FIX_ROLLBACK_SUCCEEDED: &str = "aegis.events.fix.rollback_succeeded";

// ============================================================================
// DEFENSE SUB-CHAIN
// ============================================================================

pub const DEFENSE_THREAT_DETECTED: &str = "aegis.events.defense.threat.detected";
pub const DEFENSE_THREAT_ASSESSED: &str = "aegis.events.defense.threat.assessed";
pub const DEFENSE_THREAT_ESCALATED: &str = "aegis.events.defense.threat.escalated";
pub const DEFENSE_POSTURE_CHANGED: &str = "aegis.events.defense.posture.changed";
pub const DEFENSE_ACTION_PROPOSED: &str = "aegis.events.defense.action.proposed";
pub const DEFENSE_ACTION_APPROVED: &str = "aegis.events.defense.action.approved";
pub const DEFENSE_ACTION_DEPLOYED: &str = "aegis.events.defense.action.deployed";
pub const DEFENSE_THREAT_RESOLVED: &str = "aegis.events.defense.threat.resolved";

// ============================================================================
// DOMAIN TRIGGERS AND SANDBOX EMISSIONS
// ============================================================================

pub const POWER_FAILURE: &str = "aegis.events.power.failure";
pub const RECOVERY_PLAN: &str = "aegis.events.recovery.plan";
pub const OPERATOR_STATUS: &str = "aegis.events.operator.status";
pub const AUDIT_DECISION: &str = "aegis.events.audit.decision";
pub const SYSTEM_ACTION: &str = "aegis.events.system.action";
pub const APPROVAL_REQUIRED: &str = "aegis.events.approval.required";
pub const TRANSIT_DISRUPTION_RISK: &str = "aegis.events.transit.disruption.risk";
pub const TRANSIT_HOTSPOT: &str = "aegis.events.transit.hotspot";
pub const TRANSIT_MITIGATION_APPLIED: &str = "aegis.events.transit.mitigation.applied";
pub const AIRSPACE_CONFLICT_DETECTED: &str = "aegis.events.airspace.conflict.detected";
pub const AIRSPACE_HOTSPOT_DETECTED: &str = "aegis.events.airspace.hotspot.detected";
pub const AIRSPACE_MITIGATION_APPLIED: &str = "aegis.events.airspace.mitigation.applied";
pub const GEO_INCIDENT: &str = "aegis.events.geo.incident";
pub const GEO_RISK_AREA: &str = "aegis.events.geo.risk_area";

// ============================================================================
// GROUPINGS
// ============================================================================

/// Every fix.* lifecycle topic (excluded from proposer subscriptions to
/// prevent feedback loops)
pub fn fix_topics() -> &'static [&'static str] {
    &[
        FIX_PROPOSED,
        FIX_REVIEW_REQUIRED,
        FIX_REVIEW_DECISION,
        FIX_APPROVED,
        FIX_REJECTED,
        FIX_DEPLOY_REQUESTED,
        FIX_DEPLOY_STARTED,
        FIX_DEPLOY_SUCCEEDED,
        FIX_DEPLOY_FAILED,
        FIX_VERIFIED,
        FIX_ROLLBACK_REQUESTED,
        FIX_ROLLBACK_SUCCEEDED,
    ]
}

/// Every defense.* topic (excluded from the defense detector to prevent
/// feedback loops)
pub fn defense_topics() -> &'static [&'static str] {
    &[
        DEFENSE_THREAT_DETECTED,
        DEFENSE_THREAT_ASSESSED,
        DEFENSE_THREAT_ESCALATED,
        DEFENSE_POSTURE_CHANGED,
        DEFENSE_ACTION_PROPOSED,
        DEFENSE_ACTION_APPROVED,
        DEFENSE_ACTION_DEPLOYED,
        DEFENSE_THREAT_RESOLVED,
    ]
}

/// Domain topics the fix proposer watches for critical events
pub fn trigger_topics() -> &'static [&'static str] {
    &[
        POWER_FAILURE,
        RECOVERY_PLAN,
        OPERATOR_STATUS,
        AUDIT_DECISION,
        SYSTEM_ACTION,
        APPROVAL_REQUIRED,
        TRANSIT_DISRUPTION_RISK,
        TRANSIT_HOTSPOT,
        TRANSIT_MITIGATION_APPLIED,
        AIRSPACE_CONFLICT_DETECTED,
        AIRSPACE_HOTSPOT_DETECTED,
        AIRSPACE_MITIGATION_APPLIED,
        GEO_INCIDENT,
        GEO_RISK_AREA,
    ]
}

/// Topics the defense detector correlates (domain triggers minus everything
/// the defense chain itself publishes)
pub fn defense_watch_topics() -> &'static [&'static str] {
    &[
        POWER_FAILURE,
        RECOVERY_PLAN,
        TRANSIT_DISRUPTION_RISK,
        TRANSIT_HOTSPOT,
        TRANSIT_MITIGATION_APPLIED,
        AIRSPACE_CONFLICT_DETECTED,
        AIRSPACE_HOTSPOT_DETECTED,
        AIRSPACE_MITIGATION_APPLIED,
        GEO_INCIDENT,
        GEO_RISK_AREA,
    ]
}

/// Full topic set, for the state logger
pub fn all_topics() -> Vec<&'static str> {
    let mut topics = Vec::new();
    topics.extend_from_slice(fix_topics());
    topics.extend_from_slice(defense_topics());
    topics.extend_from_slice(trigger_topics());
    topics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_topics_carry_prefix() {
        for topic in all_topics() {
            assert!(topic.starts_with(TOPIC_PREFIX), "bad prefix: {topic}");
        }
    }

    #[test]
    fn trigger_topics_exclude_fix_lifecycle() {
        for topic in trigger_topics() {
            assert!(!fix_topics().contains(topic), "loop risk: {topic}");
        }
    }

    #[test]
    fn defense_watch_excludes_defense_output() {
        for topic in defense_watch_topics() {
            assert!(!defense_topics().contains(topic), "loop risk: {topic}");
        }
    }

    #[test]
    fn no_duplicate_topics() {
        let mut topics = all_topics();
        let before = topics.len();
        topics.sort();
        topics.dedup();
        assert_eq!(before, topics.len());
    }
}
