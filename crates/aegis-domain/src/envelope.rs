//! Event envelope - the wire contract for every bus message
//!
//! Timestamps are timezone-aware only. The `rfc3339_z` serde module renders
//! UTC with a trailing `Z` and rejects offset-less strings at the bus
//! boundary, so a naive timestamp never makes it past deserialization.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::DomainError;

/// A unique event ID (UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Event severity. Variant order is the escalation order, so `>=`
/// comparisons express "at least this severe".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Moderate,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Moderate => "moderate",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope carried by every message on the bus.
///
/// `details` stays a raw JSON object here; per-topic typed views live in
/// [`crate::fix`] and [`crate::threat`] and parse at the edges. Unknown
/// fields inside `details` are preserved on pass-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event identifier, minted by the publishing process
    pub event_id: EventId,

    /// UTC timestamp, RFC 3339 with trailing `Z` on the wire
    #[serde(with = "rfc3339_z")]
    pub timestamp: DateTime<Utc>,

    /// Source component tag (e.g. "fix-proposer", "actuator")
    pub source: String,

    /// Event severity
    pub severity: Severity,

    /// Affected sector/location identifier
    pub sector_id: String,

    /// One-line human-readable summary
    pub summary: String,

    /// Correlation identifier linking a causal chain across topics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Topic-specific payload
    #[serde(default = "empty_object")]
    pub details: Value,
}

fn empty_object() -> Value {
    json!({})
}

impl Envelope {
    /// Create an envelope with a fresh event id and the current time.
    pub fn new(
        source: impl Into<String>,
        severity: Severity,
        sector_id: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Envelope {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            source: source.into(),
            severity,
            sector_id: sector_id.into(),
            summary: summary.into(),
            correlation_id: None,
            details: empty_object(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Correlation id, falling back to the event id when absent.
    pub fn correlation_or_event_id(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| self.event_id.to_string())
    }

    /// Check structural invariants beyond what serde enforces.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.source.is_empty() {
            return Err(DomainError::MissingField("source"));
        }
        if self.sector_id.is_empty() {
            return Err(DomainError::MissingField("sector_id"));
        }
        if self.summary.is_empty() {
            return Err(DomainError::MissingField("summary"));
        }
        if !self.details.is_object() {
            return Err(DomainError::Validation(
                "details must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode and validate an envelope from raw wire bytes.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, DomainError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, DomainError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether the details payload carries both mandatory sandbox markers.
    pub fn is_sandboxed(&self) -> bool {
        let details = &self.details;
        details.get("simulation_mode") == Some(&Value::Bool(true))
            && details.get("sandbox_only") == Some(&Value::Bool(true))
    }
}

/// Insert the mandatory sandbox markers into an action payload. Every event
/// that purports to affect the outside world must pass through this before
/// publication.
pub fn mark_sandboxed(details: &mut Value) {
    if let Some(map) = details.as_object_mut() {
        map.insert("simulation_mode".to_string(), Value::Bool(true));
        map.insert("sandbox_only".to_string(), Value::Bool(true));
    }
}

/// Serde adapter for RFC 3339 timestamps with a trailing `Z`.
///
/// Deserialization goes through `DateTime::parse_from_rfc3339`, which
/// requires an explicit offset - offset-less producers are a bug and get
/// rejected here rather than silently interpreted.
pub mod rfc3339_z {
    use super::*;
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| de::Error::custom(format!("timestamp '{raw}' is not RFC 3339 with offset: {e}")))
    }
}

/// Optional variant of [`rfc3339_z`]
pub mod rfc3339_z_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => super::rfc3339_z::serialize(ts, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::rfc3339_z")] DateTime<Utc>);

        let opt: Option<Wrapper> = Option::deserialize(deserializer)?;
        Ok(opt.map(|w| w.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn severity_escalation_order() {
        assert!(Severity::Critical > Severity::Moderate);
        assert!(Severity::Moderate > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn envelope_roundtrip_preserves_unknown_details() {
        let envelope = Envelope::new("test", Severity::Info, "sector-1", "hello")
            .with_details(json!({"known": 1, "future_field": {"nested": true}}));

        let bytes = envelope.to_wire().unwrap();
        let back = Envelope::from_wire(&bytes).unwrap();
        assert_eq!(back.details["future_field"]["nested"], json!(true));
        assert_eq!(back.event_id, envelope.event_id);
    }

    #[test]
    fn timestamp_serializes_with_trailing_z() {
        let envelope = Envelope::new("test", Severity::Info, "sector-1", "hello");
        let wire = String::from_utf8(envelope.to_wire().unwrap()).unwrap();
        let ts = serde_json::from_str::<Value>(&wire).unwrap()["timestamp"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(ts.ends_with('Z'), "expected trailing Z: {ts}");
    }

    #[test]
    fn naive_timestamp_rejected() {
        let raw = json!({
            "event_id": Uuid::new_v4(),
            "timestamp": "2024-06-01T12:00:00",
            "source": "test",
            "severity": "info",
            "sector_id": "sector-1",
            "summary": "naive",
            "details": {}
        });
        let result = Envelope::from_wire(raw.to_string().as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn offset_timestamp_normalized_to_utc() {
        let raw = json!({
            "event_id": Uuid::new_v4(),
            "timestamp": "2024-06-01T12:00:00+02:00",
            "source": "test",
            "severity": "warning",
            "sector_id": "sector-1",
            "summary": "offset",
            "details": {}
        });
        let envelope = Envelope::from_wire(raw.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.timestamp.to_rfc3339(), "2024-06-01T10:00:00+00:00");
    }

    #[test]
    fn validate_rejects_empty_source() {
        let mut envelope = Envelope::new("x", Severity::Info, "sector-1", "s");
        envelope.source = String::new();
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn sandbox_markers() {
        let mut details = json!({"action_type": "power-recovery-sim"});
        mark_sandboxed(&mut details);
        let envelope = Envelope::new("actuator", Severity::Info, "sector-1", "sim")
            .with_details(details);
        assert!(envelope.is_sandboxed());

        let bare = Envelope::new("actuator", Severity::Info, "sector-1", "sim")
            .with_details(json!({"simulation_mode": true}));
        assert!(!bare.is_sandboxed());
    }

    #[test]
    fn correlation_falls_back_to_event_id() {
        let envelope = Envelope::new("x", Severity::Info, "sector-1", "s");
        assert_eq!(envelope.correlation_or_event_id(), envelope.event_id.to_string());

        let tagged = Envelope::new("x", Severity::Info, "sector-1", "s")
            .with_correlation("INC-1");
        assert_eq!(tagged.correlation_or_event_id(), "INC-1");
    }
}
