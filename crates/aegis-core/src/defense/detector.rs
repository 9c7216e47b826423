//! Defense threat detector
//!
//! Correlates a one-hour sliding window of located, non-defense events in
//! ~1 km spatial buckets and fires on four rule families:
//!
//! 1. event spike - N events in the same bucket within the spike window
//! 2. conflicting sensor data - >50% aircraft-count jump inside 30 s
//! 3. environmental risk - risk score at or above threshold
//! 4. multi-system stress - 3+ stressed domains in one bucket inside 2 min
//!
//! Detections are deduplicated against recent threats of the same type
//! within the configured radius and window before anything is published.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Map;
use tracing::{debug, info, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::threat::{ThreatDetails, ThreatSeverity, ThreatType, DEFENSE_DISCLAIMER};
use aegis_domain::{topics, Envelope, Severity};

use crate::defense::geo::{extract_location, EventLocation};
use crate::telemetry::COUNTERS;

/// Rule thresholds. The dedup pair comes from engine config; the rest are
/// fixed detection constants.
#[derive(Debug, Clone, Copy)]
pub struct DetectorThresholds {
    pub spike_window_secs: i64,
    pub spike_min_events: usize,
    pub conflict_window_secs: i64,
    pub stress_window_secs: i64,
    pub environmental_risk_threshold: f64,
    pub dedup_window_secs: i64,
    pub dedup_radius_km: f64,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        DetectorThresholds {
            spike_window_secs: 60,
            spike_min_events: 10,
            conflict_window_secs: 30,
            stress_window_secs: 120,
            environmental_risk_threshold: 0.7,
            dedup_window_secs: 300,
            dedup_radius_km: 5.0,
        }
    }
}

struct SeenEvent {
    time: DateTime<Utc>,
    location: EventLocation,
    grid: String,
    severity: Severity,
    system: &'static str,
}

struct RecentThreat {
    time: DateTime<Utc>,
    location: EventLocation,
    threat_type: ThreatType,
}

#[derive(Default)]
struct DetectorState {
    history: Vec<SeenEvent>,
    aircraft_counts: HashMap<String, Vec<(DateTime<Utc>, f64)>>,
    recent_threats: Vec<RecentThreat>,
}

struct Candidate {
    threat_type: ThreatType,
    confidence: f64,
    severity: ThreatSeverity,
    rule: &'static str,
    description: String,
}

/// Detects threats from the correlated event streams.
pub struct DefenseDetector {
    bus: Arc<dyn MessageBus>,
    thresholds: DetectorThresholds,
    state: Mutex<DetectorState>,
    source_id: String,
}

impl DefenseDetector {
    pub fn new(bus: Arc<dyn MessageBus>, thresholds: DetectorThresholds) -> Arc<Self> {
        Arc::new(DefenseDetector {
            bus,
            thresholds,
            state: Mutex::new(DetectorState::default()),
            source_id: "defense-detector".to_string(),
        })
    }

    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        for topic in topics::defense_watch_topics() {
            self.bus.subscribe(topic, self.clone()).await?;
        }
        Ok(())
    }

    fn system_of(topic: &str) -> &'static str {
        if topic.contains("airspace") {
            "airspace"
        } else if topic.contains("transit") {
            "transit"
        } else if topic.contains("power") || topic.contains("recovery") {
            "power"
        } else if topic.contains("geo") {
            "traffic"
        } else {
            "unknown"
        }
    }

    fn threat_type_of(topic: &str) -> ThreatType {
        if topic.contains("airspace") {
            ThreatType::Airspace
        } else if topic.contains("power") {
            ThreatType::CyberPhysical
        } else if topic.contains("risk") {
            ThreatType::Environmental
        } else {
            ThreatType::Civil
        }
    }

    // -- rules, evaluated under the state lock ------------------------------

    fn detect_spike(
        &self,
        state: &DetectorState,
        grid: &str,
        now: DateTime<Utc>,
    ) -> Option<(f64, ThreatSeverity)> {
        let cutoff = now - Duration::seconds(self.thresholds.spike_window_secs);
        let count = state
            .history
            .iter()
            .filter(|e| e.time >= cutoff && e.grid == grid)
            .count();
        if count < self.thresholds.spike_min_events {
            return None;
        }

        let magnitude = count as f64 / self.thresholds.spike_min_events as f64;
        let confidence = (0.5 + (magnitude - 1.0) * 0.1).min(0.9);
        let severity = if magnitude >= 3.0 {
            ThreatSeverity::Critical
        } else if magnitude >= 2.0 {
            ThreatSeverity::High
        } else if magnitude >= 1.5 {
            ThreatSeverity::Med
        } else {
            ThreatSeverity::Low
        };
        info!(grid, count, "event spike detected");
        Some((confidence, severity))
    }

    fn detect_sensor_conflict(
        &self,
        state: &mut DetectorState,
        topic: &str,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Option<(f64, ThreatSeverity)> {
        if !topic.contains("airspace") || envelope.sector_id.is_empty() {
            return None;
        }
        let current = envelope
            .details
            .get("aircraft_count")
            .or_else(|| envelope.details.get("count"))
            .and_then(|v| v.as_f64())?;

        let cutoff = now - Duration::seconds(self.thresholds.conflict_window_secs);
        let counts = state
            .aircraft_counts
            .entry(envelope.sector_id.clone())
            .or_default();

        let verdict = counts
            .iter()
            .rev()
            .find(|(t, _)| *t >= cutoff)
            .and_then(|(_, last)| {
                if *last <= 0.0 {
                    return None;
                }
                let ratio = (current - last).abs() / last;
                if ratio <= 0.5 {
                    return None;
                }
                let confidence = (0.6 + ratio * 0.5).min(0.85);
                let severity = if ratio > 1.0 {
                    ThreatSeverity::High
                } else {
                    ThreatSeverity::Med
                };
                warn!(
                    sector = %envelope.sector_id,
                    last, current, "conflicting sensor data"
                );
                Some((confidence, severity))
            });

        counts.push((now, current));
        let hour_ago = now - Duration::hours(1);
        counts.retain(|(t, _)| *t >= hour_ago);

        verdict
    }

    fn detect_environmental_risk(&self, envelope: &Envelope) -> Option<(f64, ThreatSeverity)> {
        let details = &envelope.details;
        let score = details
            .get("risk_score")
            .or_else(|| details.get("risk"))
            .or_else(|| details.get("environmental_risk"))
            .and_then(|v| v.as_f64())?;
        if score < self.thresholds.environmental_risk_threshold {
            return None;
        }

        let confidence =
            (0.7 + (score - self.thresholds.environmental_risk_threshold) * 0.4).min(0.9);
        let severity = if score >= 0.9 {
            ThreatSeverity::Critical
        } else if score >= 0.8 {
            ThreatSeverity::High
        } else {
            ThreatSeverity::Med
        };
        warn!(score, "environmental risk threshold crossed");
        Some((confidence, severity))
    }

    fn detect_multi_system_stress(
        &self,
        state: &DetectorState,
        grid: &str,
        now: DateTime<Utc>,
    ) -> Option<(f64, ThreatSeverity)> {
        let cutoff = now - Duration::seconds(self.thresholds.stress_window_secs);
        let stressed: std::collections::HashSet<&str> = state
            .history
            .iter()
            .filter(|e| e.time >= cutoff && e.grid == grid && e.severity >= Severity::Moderate)
            .map(|e| e.system)
            .collect();

        if stressed.len() < 3 {
            return None;
        }

        let confidence = (0.7 + stressed.len() as f64 * 0.05).min(0.95);
        let severity = if stressed.len() >= 5 {
            ThreatSeverity::Critical
        } else if stressed.len() >= 4 {
            ThreatSeverity::High
        } else {
            ThreatSeverity::Med
        };
        warn!(grid, systems = stressed.len(), "multi-system stress detected");
        Some((confidence, severity))
    }

    fn is_duplicate(
        &self,
        state: &DetectorState,
        location: &EventLocation,
        threat_type: &ThreatType,
        now: DateTime<Utc>,
    ) -> bool {
        let cutoff = now - Duration::seconds(self.thresholds.dedup_window_secs);
        state.recent_threats.iter().any(|t| {
            t.time >= cutoff
                && t.threat_type == *threat_type
                && t.location.distance_km(location) <= self.thresholds.dedup_radius_km
        })
    }

    // -- event handling -----------------------------------------------------

    async fn on_event(&self, topic: &str, envelope: &Envelope) -> crate::Result<()> {
        // Never feed on defense output.
        if topic.contains(".defense.") {
            return Ok(());
        }
        let Some(location) = extract_location(envelope) else {
            debug!(topic, "skipping event without location");
            return Ok(());
        };

        let now = Utc::now();
        let grid = location.grid_key();
        let system = Self::system_of(topic);

        // Evaluate rules and update history under one lock; publishing
        // happens after it is released.
        let (candidates, sources): (Vec<Candidate>, Vec<String>) = {
            let mut state = self.state.lock().expect("detector lock poisoned");

            state.history.push(SeenEvent {
                time: now,
                location,
                grid: grid.clone(),
                severity: envelope.severity,
                system,
            });
            let hour_ago = now - Duration::hours(1);
            state.history.retain(|e| e.time >= hour_ago);

            let mut found = Vec::new();
            if let Some((confidence, severity)) = self.detect_spike(&state, &grid, now) {
                found.push(Candidate {
                    threat_type: ThreatType::Civil,
                    confidence,
                    severity,
                    rule: "event_spike",
                    description: "Sudden spike of events in area".to_string(),
                });
            }
            if let Some((confidence, severity)) =
                self.detect_sensor_conflict(&mut state, topic, envelope, now)
            {
                found.push(Candidate {
                    threat_type: Self::threat_type_of(topic),
                    confidence,
                    severity,
                    rule: "conflicting_sensor_data",
                    description: "Conflicting sensor data detected".to_string(),
                });
            }
            if let Some((confidence, severity)) = self.detect_environmental_risk(envelope) {
                found.push(Candidate {
                    threat_type: ThreatType::Environmental,
                    confidence,
                    severity,
                    rule: "environmental_risk",
                    description: "Environmental risk threshold crossed".to_string(),
                });
            }
            if let Some((confidence, severity)) =
                self.detect_multi_system_stress(&state, &grid, now)
            {
                found.push(Candidate {
                    threat_type: ThreatType::CyberPhysical,
                    confidence,
                    severity,
                    rule: "multi_system_stress",
                    description: "Multiple systems under stress".to_string(),
                });
            }

            // Dedup and reserve the slot while still holding the lock so a
            // racing event cannot double-publish the same threat.
            let mut deduped = Vec::new();
            for candidate in found {
                if self.is_duplicate(&state, &location, &candidate.threat_type, now) {
                    debug!(rule = candidate.rule, "duplicate threat suppressed");
                    continue;
                }
                state.recent_threats.push(RecentThreat {
                    time: now,
                    location,
                    threat_type: candidate.threat_type,
                });
                deduped.push(candidate);
            }
            state.recent_threats.retain(|t| t.time >= hour_ago);

            // Contributing domains seen recently in this bucket.
            let sources: Vec<String> = {
                let mut seen = Vec::new();
                for event in state.history.iter().rev().take(20) {
                    if event.grid == grid && !seen.contains(&event.system.to_string()) {
                        seen.push(event.system.to_string());
                    }
                }
                if seen.is_empty() {
                    seen.push(system.to_string());
                }
                seen
            };

            (deduped, sources)
        };

        for candidate in candidates {
            self.publish_threat(envelope, &location, candidate, sources.clone(), now)
                .await?;
        }
        Ok(())
    }

    async fn publish_threat(
        &self,
        trigger: &Envelope,
        location: &EventLocation,
        candidate: Candidate,
        sources: Vec<String>,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        let threat_id = ThreatDetails::mint_id(now);
        let summary = format!("{} (rule: {})", candidate.description, candidate.rule);
        let details = ThreatDetails {
            threat_id: threat_id.clone(),
            threat_type: candidate.threat_type,
            confidence_score: candidate.confidence,
            severity: candidate.severity,
            affected_area: Some(location.square_polygon(2.0)),
            sources,
            summary: summary.clone(),
            detected_at: now,
            disclaimer: DEFENSE_DISCLAIMER.to_string(),
            extra: Map::new(),
        };
        details.validate()?;

        let envelope_severity = match candidate.severity {
            ThreatSeverity::High | ThreatSeverity::Critical => Severity::Critical,
            _ => Severity::Moderate,
        };
        let envelope = Envelope::new(
            &self.source_id,
            envelope_severity,
            &trigger.sector_id,
            format!("Threat {threat_id} detected: {summary}"),
        )
        .with_correlation(&threat_id)
        .with_details(details.to_value()?);

        self.bus
            .publish(topics::DEFENSE_THREAT_DETECTED, &envelope)
            .await?;
        COUNTERS.inc_threats_detected();
        warn!(
            threat_id = %threat_id,
            rule = candidate.rule,
            confidence = candidate.confidence,
            severity = candidate.severity.as_str(),
            "threat detected"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for DefenseDetector {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        if let Err(e) = self.on_event(topic, &envelope).await {
            warn!(topic, error = %e, "defense detector handler failed");
        }
    }
}
