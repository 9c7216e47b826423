//! Threat schema for the defense sub-chain
//!
//! Threats parallel fixes: a keyed entity with confidence and severity that
//! flows through detect -> assess -> act -> verify. The whole sub-chain is
//! informational; every threat carries a mandatory disclaimer saying so.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::envelope::rfc3339_z;
use crate::error::DomainError;

/// Mandatory disclaimer carried by every threat event
pub const DEFENSE_DISCLAIMER: &str =
    "Defense features are non-kinetic and informational only.";

/// Threat taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    Airspace,
    CyberPhysical,
    Environmental,
    Civil,
}

/// Threat severity (distinct scale from event severity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSeverity {
    Low,
    Med,
    High,
    Critical,
}

impl ThreatSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatSeverity::Low => "low",
            ThreatSeverity::Med => "med",
            ThreatSeverity::High => "high",
            ThreatSeverity::Critical => "critical",
        }
    }
}

/// Details payload for `defense.threat.detected`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatDetails {
    /// Unique threat identifier (`THREAT-YYYYMMDD-<8 hex>`)
    pub threat_id: String,

    pub threat_type: ThreatType,

    /// Detection confidence in [0, 1]
    pub confidence_score: f64,

    pub severity: ThreatSeverity,

    /// GeoJSON geometry of the affected area
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_area: Option<Value>,

    /// Contributing domains (transit, airspace, power, ...)
    #[serde(default)]
    pub sources: Vec<String>,

    pub summary: String,

    #[serde(with = "rfc3339_z")]
    pub detected_at: DateTime<Utc>,

    /// Non-empty by invariant; see [`DEFENSE_DISCLAIMER`]
    pub disclaimer: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ThreatDetails {
    /// Mint a threat id of the canonical `THREAT-YYYYMMDD-<8 hex>` form.
    pub fn mint_id(now: DateTime<Utc>) -> String {
        let tail = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        format!("THREAT-{}-{}", now.format("%Y%m%d"), tail)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.threat_id.is_empty() {
            return Err(DomainError::MissingField("threat_id"));
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(DomainError::InvalidValue {
                field: "confidence_score",
                reason: format!("{} outside [0, 1]", self.confidence_score),
            });
        }
        if self.disclaimer.is_empty() {
            return Err(DomainError::MissingField("disclaimer"));
        }
        Ok(())
    }

    pub fn from_value(value: &Value) -> Result<Self, DomainError> {
        let details: ThreatDetails = serde_json::from_value(value.clone())?;
        details.validate()?;
        Ok(details)
    }

    pub fn to_value(&self) -> Result<Value, DomainError> {
        Ok(serde_json::to_value(self)?)
    }
}

// ============================================================================
// DEFENSE ACTIONS
// ============================================================================

/// Closed set of informational defense actions. None of these touch the
/// outside world; each resolves to sandbox-marked `system.action` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefenseActionType {
    RaiseAlertLevel,
    PublicAdvisory,
    MonitoringBoost,
    AutonomyLock,
}

impl DefenseActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefenseActionType::RaiseAlertLevel => "raise-alert-level",
            DefenseActionType::PublicAdvisory => "public-advisory",
            DefenseActionType::MonitoringBoost => "monitoring-boost",
            DefenseActionType::AutonomyLock => "autonomy-lock",
        }
    }
}

impl std::fmt::Display for DefenseActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details payload for `defense.action.proposed|approved|deployed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefenseActionDetails {
    /// Idempotency key for defense actuation (`DACT-YYYYMMDD-<8 hex>`)
    pub action_id: String,

    /// The threat this action responds to
    pub threat_id: String,

    #[serde(rename = "type")]
    pub action_type: DefenseActionType,

    #[serde(default)]
    pub params: Map<String, Value>,

    pub proposed_by: String,

    pub disclaimer: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DefenseActionDetails {
    pub fn mint_id(now: DateTime<Utc>) -> String {
        let tail = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        format!("DACT-{}-{}", now.format("%Y%m%d"), tail)
    }

    pub fn from_value(value: &Value) -> Result<Self, DomainError> {
        let details: DefenseActionDetails = serde_json::from_value(value.clone())?;
        if details.action_id.is_empty() {
            return Err(DomainError::MissingField("action_id"));
        }
        if details.threat_id.is_empty() {
            return Err(DomainError::MissingField("threat_id"));
        }
        Ok(details)
    }

    pub fn to_value(&self) -> Result<Value, DomainError> {
        Ok(serde_json::to_value(self)?)
    }
}

// ============================================================================
// DEFENSE POSTURE
// ============================================================================

/// City-wide defense posture. Variant order is the escalation order, so
/// `>` comparisons express "more alert than".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefensePosture {
    #[default]
    Normal,
    Elevated,
    HeightenedAlert,
    Critical,
}

impl DefensePosture {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefensePosture::Normal => "normal",
            DefensePosture::Elevated => "elevated",
            DefensePosture::HeightenedAlert => "heightened_alert",
            DefensePosture::Critical => "critical",
        }
    }
}

impl std::fmt::Display for DefensePosture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details payload for `defense.posture.changed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostureChange {
    /// Posture change identifier (`POSTURE-YYYYMMDD-<8 hex>`)
    pub posture_id: String,

    pub previous_posture: DefensePosture,
    pub new_posture: DefensePosture,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_reason: Option<String>,

    pub changed_by: String,

    #[serde(with = "rfc3339_z")]
    pub changed_at: DateTime<Utc>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PostureChange {
    pub fn mint_id(now: DateTime<Utc>) -> String {
        let tail = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        format!("POSTURE-{}-{}", now.format("%Y%m%d"), tail)
    }

    pub fn to_value(&self) -> Result<Value, DomainError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Details payload for `defense.threat.assessed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub threat_id: String,

    /// Assessment score in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment_score: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment_notes: Option<String>,

    pub assessed_by: String,

    #[serde(with = "rfc3339_z")]
    pub assessed_at: DateTime<Utc>,

    /// Recommended informational actions
    #[serde(default)]
    pub recommended_actions: Vec<DefenseActionType>,

    /// Posture the assessor considers appropriate for this threat
    #[serde(default)]
    pub recommended_posture: DefensePosture,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_threat() -> ThreatDetails {
        ThreatDetails {
            threat_id: ThreatDetails::mint_id(Utc::now()),
            threat_type: ThreatType::Airspace,
            confidence_score: 0.75,
            severity: ThreatSeverity::High,
            affected_area: Some(json!({
                "type": "Polygon",
                "coordinates": [[[-75.7, 45.4], [-75.6, 45.4], [-75.6, 45.5], [-75.7, 45.5], [-75.7, 45.4]]]
            })),
            sources: vec!["airspace".to_string()],
            summary: "Unusual airspace activity".to_string(),
            detected_at: Utc::now(),
            disclaimer: DEFENSE_DISCLAIMER.to_string(),
            extra: Map::new(),
        }
    }

    #[test]
    fn threat_id_shape() {
        let id = ThreatDetails::mint_id(Utc::now());
        assert!(id.starts_with("THREAT-"));
        assert_eq!(id.len(), "THREAT-".len() + 8 + 1 + 8);
    }

    #[test]
    fn confidence_bounds_enforced() {
        let mut threat = sample_threat();
        threat.confidence_score = 1.2;
        assert!(threat.validate().is_err());
        threat.confidence_score = -0.1;
        assert!(threat.validate().is_err());
        threat.confidence_score = 0.0;
        assert!(threat.validate().is_ok());
    }

    #[test]
    fn empty_disclaimer_rejected() {
        let mut threat = sample_threat();
        threat.disclaimer = String::new();
        assert!(threat.validate().is_err());
    }

    #[test]
    fn threat_type_wire_names() {
        assert_eq!(
            serde_json::to_value(ThreatType::CyberPhysical).unwrap(),
            json!("cyber_physical")
        );
    }

    #[test]
    fn posture_escalation_order() {
        assert!(DefensePosture::Critical > DefensePosture::HeightenedAlert);
        assert!(DefensePosture::HeightenedAlert > DefensePosture::Elevated);
        assert!(DefensePosture::Elevated > DefensePosture::Normal);
        assert_eq!(DefensePosture::default(), DefensePosture::Normal);
    }

    #[test]
    fn posture_wire_names() {
        assert_eq!(
            serde_json::to_value(DefensePosture::HeightenedAlert).unwrap(),
            json!("heightened_alert")
        );
        let back: DefensePosture = serde_json::from_value(json!("elevated")).unwrap();
        assert_eq!(back, DefensePosture::Elevated);
    }

    #[test]
    fn posture_change_roundtrip() {
        let change = PostureChange {
            posture_id: PostureChange::mint_id(Utc::now()),
            previous_posture: DefensePosture::Normal,
            new_posture: DefensePosture::HeightenedAlert,
            change_reason: Some("Multiple threats detected in region".to_string()),
            changed_by: "defense-assessor".to_string(),
            changed_at: Utc::now(),
            extra: Map::new(),
        };
        assert!(change.posture_id.starts_with("POSTURE-"));
        let value = change.to_value().unwrap();
        assert_eq!(value["new_posture"], json!("heightened_alert"));
        assert_eq!(value["previous_posture"], json!("normal"));
    }

    #[test]
    fn defense_action_roundtrip() {
        let action = DefenseActionDetails {
            action_id: DefenseActionDetails::mint_id(Utc::now()),
            threat_id: "THREAT-20240601-DEADBEEF".to_string(),
            action_type: DefenseActionType::PublicAdvisory,
            params: Map::new(),
            proposed_by: "defense-assessor".to_string(),
            disclaimer: DEFENSE_DISCLAIMER.to_string(),
            extra: Map::new(),
        };
        let value = action.to_value().unwrap();
        assert_eq!(value["type"], json!("public-advisory"));
        let back = DefenseActionDetails::from_value(&value).unwrap();
        assert_eq!(back.action_id, action.action_id);
    }
}
