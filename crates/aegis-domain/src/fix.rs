//! Fix schema - the central entity of the remediation lifecycle
//!
//! A fix is a proposed remediation: one or more sandboxed actions, an
//! expected-impact claim, a risk level, and per-action verification
//! criteria. `fix_id` is the idempotency key for the whole lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::envelope::{rfc3339_z, rfc3339_z_opt};
use crate::error::DomainError;

// ============================================================================
// ACTION TYPES
// ============================================================================

/// Closed set of action types. Every variant is a simulation - the actuator
/// never emits anything without sandbox markers.
///
/// Unrecognized wire values parse into `Other` instead of failing: a fix
/// carrying one must still reach the actuator so it can end the lifecycle
/// with an explicit `fix.deploy_failed` rather than vanish at the decode
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionType {
    TransitRerouteSim,
    TrafficAdvisorySim,
    AirspaceMitigationSim,
    PowerRecoverySim,
    /// Synthesized by the verifier when a deployed fix fails its metrics
    RollbackSim,
    /// Anything outside the closed set; rejected at dispatch, not at parse
    Other(String),
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            ActionType::TransitRerouteSim => "transit-reroute-sim",
            ActionType::TrafficAdvisorySim => "traffic-advisory-sim",
            ActionType::AirspaceMitigationSim => "airspace-mitigation-sim",
            ActionType::PowerRecoverySim => "power-recovery-sim",
            ActionType::RollbackSim => "rollback-sim",
            ActionType::Other(s) => s,
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "transit-reroute-sim" => ActionType::TransitRerouteSim,
            "traffic-advisory-sim" => ActionType::TrafficAdvisorySim,
            "airspace-mitigation-sim" => ActionType::AirspaceMitigationSim,
            "power-recovery-sim" => ActionType::PowerRecoverySim,
            "rollback-sim" => ActionType::RollbackSim,
            other => ActionType::Other(other.to_string()),
        }
    }

    /// Whether this value belongs to the closed set.
    pub fn is_known(&self) -> bool {
        !matches!(self, ActionType::Other(_))
    }
}

impl Serialize for ActionType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ActionType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ActionType::from_wire(&raw))
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain-specific selector for an action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionTarget {
    /// Route identifier (transit actions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,

    /// Sector identifier (power/airspace actions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<String>,

    /// Bounding box for area-based actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_bbox: Option<Value>,

    /// Stop identifier (transit actions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,

    /// Flight identifier (airspace actions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flight_id: Option<String>,
}

/// Verification clause: metric, threshold, observation window. Absence means
/// the action is not independently verifiable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionVerification {
    /// Metric name to verify (e.g. "delay_reduction", "voltage_stable")
    pub metric_name: String,

    /// Threshold the observed metric must meet
    pub threshold: f64,

    /// Observation window after deployment, in seconds
    pub window_seconds: u64,
}

/// A typed, targeted, parameterized side effect - always sandboxed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,

    pub target: ActionTarget,

    #[serde(default)]
    pub params: Map<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<ActionVerification>,
}

// ============================================================================
// FIX
// ============================================================================

/// Risk level of a fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Med,
    High,
}

/// Which proposer generated the fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixSource {
    /// Deterministic rule engine (terminal fallback)
    Rules,
    /// Primary external LLM provider
    LlmPrimary,
    /// Fallback external LLM provider
    LlmFallback,
}

/// Structured expected-impact claim
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedImpact {
    /// Expected delay reduction in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_reduction: Option<f64>,

    /// Expected change in risk score
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score_delta: Option<f64>,

    /// Geographic area affected (bbox or geometry)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_affected: Option<Value>,
}

/// Details payload shared by every fix.* lifecycle event.
///
/// Lifecycle events carry identical details plus stage-specific fields; the
/// flattened `extra` map keeps those (and any future fields) intact across
/// pass-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixDetails {
    /// Stable, globally unique idempotency key (`FIX-YYYYMMDD-<8 hex>`)
    pub fix_id: String,

    /// Ties the fix to its originating incident/hotspot/plan
    pub correlation_id: String,

    pub source: FixSource,

    pub title: String,
    pub summary: String,

    /// Ordered action list; at least one
    pub actions: Vec<FixAction>,

    pub risk_level: RiskLevel,

    #[serde(default)]
    pub expected_impact: ExpectedImpact,

    #[serde(with = "rfc3339_z")]
    pub created_at: DateTime<Utc>,

    pub proposed_by: String,

    #[serde(default = "default_true")]
    pub requires_human_approval: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,

    #[serde(default, with = "rfc3339_z_opt", skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,

    #[serde(default, with = "rfc3339_z_opt", skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,

    /// Stage-specific and forward-compatible fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl FixDetails {
    /// Mint a fix id of the canonical `FIX-YYYYMMDD-<8 hex>` form.
    pub fn mint_id(now: DateTime<Utc>) -> String {
        let tail = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        format!("FIX-{}-{}", now.format("%Y%m%d"), tail)
    }

    /// Validate the schema invariants a proposer must satisfy.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.fix_id.is_empty() {
            return Err(DomainError::MissingField("fix_id"));
        }
        if self.correlation_id.is_empty() {
            return Err(DomainError::MissingField("correlation_id"));
        }
        if self.title.is_empty() {
            return Err(DomainError::MissingField("title"));
        }
        if self.actions.is_empty() {
            return Err(DomainError::Validation(
                "fix must carry at least one action".to_string(),
            ));
        }
        for action in &self.actions {
            if let Some(verification) = &action.verification {
                if verification.metric_name.is_empty() {
                    return Err(DomainError::MissingField("verification.metric_name"));
                }
            }
        }
        Ok(())
    }

    /// Whether any action falls outside the closed type set. Proposers must
    /// refuse such drafts; the actuator turns them into `deploy_failed`.
    pub fn has_unknown_actions(&self) -> bool {
        self.actions.iter().any(|a| !a.action_type.is_known())
    }

    /// Parse a fix details payload out of an envelope's `details` value.
    pub fn from_value(value: &Value) -> Result<Self, DomainError> {
        let details: FixDetails = serde_json::from_value(value.clone())?;
        details.validate()?;
        Ok(details)
    }

    pub fn to_value(&self) -> Result<Value, DomainError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_details() -> FixDetails {
        FixDetails {
            fix_id: FixDetails::mint_id(Utc::now()),
            correlation_id: "HOTSPOT-42".to_string(),
            source: FixSource::Rules,
            title: "Reroute Route 95".to_string(),
            summary: "Bypass congestion near downtown".to_string(),
            actions: vec![FixAction {
                action_type: ActionType::TransitRerouteSim,
                target: ActionTarget {
                    route_id: Some("ROUTE-95".to_string()),
                    ..Default::default()
                },
                params: Map::new(),
                verification: Some(ActionVerification {
                    metric_name: "delay_reduction".to_string(),
                    threshold: 10.0,
                    window_seconds: 300,
                }),
            }],
            risk_level: RiskLevel::Med,
            expected_impact: ExpectedImpact {
                delay_reduction: Some(15.0),
                risk_score_delta: Some(-0.2),
                area_affected: None,
            },
            created_at: Utc::now(),
            proposed_by: "fix-proposer".to_string(),
            requires_human_approval: true,
            review_notes: None,
            approved_by: None,
            deployed_at: None,
            verified_at: None,
            rollback_reason: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn mint_id_shape() {
        let id = FixDetails::mint_id(Utc::now());
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts[0], "FIX");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[2], parts[2].to_uppercase());
    }

    #[test]
    fn mint_id_unique() {
        let now = Utc::now();
        assert_ne!(FixDetails::mint_id(now), FixDetails::mint_id(now));
    }

    #[test]
    fn action_type_wire_names() {
        assert_eq!(
            serde_json::to_value(ActionType::TransitRerouteSim).unwrap(),
            json!("transit-reroute-sim")
        );
        assert_eq!(
            serde_json::to_value(ActionType::PowerRecoverySim).unwrap(),
            json!("power-recovery-sim")
        );
    }

    #[test]
    fn details_roundtrip_keeps_extra_fields() {
        let mut details = sample_details();
        details
            .extra
            .insert("deploy_succeeded_at".to_string(), json!("2024-06-01T10:00:00Z"));

        let value = details.to_value().unwrap();
        let back = FixDetails::from_value(&value).unwrap();
        assert_eq!(back.extra["deploy_succeeded_at"], json!("2024-06-01T10:00:00Z"));
        assert_eq!(back.fix_id, details.fix_id);
    }

    #[test]
    fn validate_rejects_empty_actions() {
        let mut details = sample_details();
        details.actions.clear();
        assert!(details.validate().is_err());
    }

    #[test]
    fn unknown_action_type_parses_as_other() {
        let mut value = sample_details().to_value().unwrap();
        value["actions"][0]["type"] = json!("drain-the-ocean");
        let details = FixDetails::from_value(&value).unwrap();
        assert!(details.has_unknown_actions());
        assert_eq!(details.actions[0].action_type.as_str(), "drain-the-ocean");
        // Round-trips byte-identically
        assert_eq!(details.to_value().unwrap()["actions"][0]["type"], json!("drain-the-ocean"));
    }

    #[test]
    fn risk_level_ordering() {
        assert!(RiskLevel::High > RiskLevel::Med);
        assert!(RiskLevel::Med > RiskLevel::Low);
    }
}
