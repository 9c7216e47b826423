//! Verification metric semantics
//!
//! Pure computations over event-store slices; the verifier supplies the
//! windows and the store access. Each metric compares an observed average
//! against a claimed baseline of `average * k`. The factor is a stand-in
//! for a real pre-deployment baseline and therefore configurable rather
//! than buried in the computation; the reading keeps both numbers so the
//! provenance lands in the verification record.

use serde::{Deserialize, Serialize};
use serde_json::json;

use aegis_domain::Severity;
use aegis_state::StoredEvent;

/// Baseline multipliers per action family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaselineFactors {
    pub transit: f64,
    pub traffic: f64,
    pub airspace: f64,
}

impl Default for BaselineFactors {
    fn default() -> Self {
        BaselineFactors {
            transit: 1.5,
            traffic: 1.2,
            airspace: 1.3,
        }
    }
}

/// Nominal grid voltage reported when a sector shows no failures.
const NOMINAL_VOLTAGE: f64 = 120.0;

/// One computed metric with its evidence.
#[derive(Debug, Clone, Serialize)]
pub struct MetricReading {
    pub metric_name: String,
    /// The value compared against the threshold
    pub actual: f64,
    pub observed_average: f64,
    pub baseline: f64,
    pub sample_count: usize,
}

impl MetricReading {
    pub fn evidence(&self) -> serde_json::Value {
        json!({
            "metric_name": self.metric_name,
            "actual": self.actual,
            "observed_average": self.observed_average,
            "baseline": self.baseline,
            "sample_count": self.sample_count,
        })
    }
}

/// Average transit delay over the window; the claim baseline is
/// `avg * factor` and the metric is the implied reduction.
pub fn delay_reduction(events: &[StoredEvent], factor: f64) -> MetricReading {
    let delays: Vec<f64> = events
        .iter()
        .filter_map(|e| {
            let details = &e.envelope.details;
            details
                .get("delay")
                .or_else(|| details.get("average_delay_minutes"))
                .and_then(|v| v.as_f64())
        })
        .filter(|d| *d > 0.0)
        .collect();

    let average = mean(&delays);
    let baseline = average * factor;
    MetricReading {
        metric_name: "delay_reduction".to_string(),
        actual: baseline - average,
        observed_average: average,
        baseline,
        sample_count: events.len(),
    }
}

/// Average risk score over the window; metric is the implied delta from the
/// claimed baseline.
pub fn risk_score_delta(events: &[StoredEvent], factor: f64) -> MetricReading {
    let scores: Vec<f64> = events
        .iter()
        .filter_map(|e| e.envelope.details.get("risk_score").and_then(|v| v.as_f64()))
        .collect();

    let average = if scores.is_empty() { 1.0 } else { mean(&scores) };
    let baseline = average * factor;
    MetricReading {
        metric_name: "risk_score_delta".to_string(),
        actual: baseline - average,
        observed_average: average,
        baseline,
        sample_count: events.len(),
    }
}

/// Hotspot congestion from event severities (info 0.2, warning 0.5,
/// moderate 0.7, critical 1.0); metric is the implied reduction.
pub fn congestion_score(events: &[StoredEvent], factor: f64) -> MetricReading {
    let scores: Vec<f64> = events
        .iter()
        .map(|e| match e.envelope.severity {
            Severity::Info => 0.2,
            Severity::Warning => 0.5,
            Severity::Moderate => 0.7,
            Severity::Critical => 1.0,
        })
        .collect();

    let average = mean(&scores);
    let baseline = average * factor;
    MetricReading {
        metric_name: "congestion_score".to_string(),
        actual: baseline - average,
        observed_average: average,
        baseline,
        sample_count: events.len(),
    }
}

/// Stability by absence: no `power.failure` events in the window means the
/// sector held. Actual is 1.0/0.0 for threshold comparison.
pub fn voltage_stable(events: &[StoredEvent]) -> MetricReading {
    let stable = events.is_empty();
    let voltage = if stable { NOMINAL_VOLTAGE } else { 0.0 };
    MetricReading {
        metric_name: "voltage_stable".to_string(),
        actual: if stable { 1.0 } else { 0.0 },
        observed_average: voltage,
        baseline: NOMINAL_VOLTAGE,
        sample_count: events.len(),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Polarity
// ---------------------------------------------------------------------------

/// How a metric's actual value compares against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricPolarity {
    /// Reduction metrics pass when `actual >= threshold`
    Reduction,
    /// Delta metrics pass when `|actual| >= |threshold|`
    AbsoluteDelta,
    /// Boolean stability metrics pass when `actual == threshold` (0/1)
    BooleanStability,
}

/// Polarity by metric name. Unknown names fall back to plain reduction.
pub fn polarity_for(metric_name: &str) -> MetricPolarity {
    match metric_name {
        "risk_score_delta" => MetricPolarity::AbsoluteDelta,
        "voltage_stable" => MetricPolarity::BooleanStability,
        _ => MetricPolarity::Reduction,
    }
}

/// Apply a polarity comparison.
pub fn passes(polarity: MetricPolarity, actual: f64, threshold: f64) -> bool {
    match polarity {
        MetricPolarity::Reduction => actual >= threshold,
        MetricPolarity::AbsoluteDelta => actual.abs() >= threshold.abs(),
        MetricPolarity::BooleanStability => (actual != 0.0) == (threshold != 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_domain::Envelope;
    use chrono::Utc;
    use serde_json::json;

    fn event(severity: Severity, details: serde_json::Value) -> StoredEvent {
        StoredEvent {
            topic: "test".to_string(),
            envelope: Envelope::new("test", severity, "sector-1", "s").with_details(details),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn delay_reduction_uses_claimed_baseline() {
        let events = vec![
            event(Severity::Warning, json!({"delay": 10.0})),
            event(Severity::Warning, json!({"average_delay_minutes": 20.0})),
        ];
        let reading = delay_reduction(&events, 1.5);
        assert!((reading.observed_average - 15.0).abs() < 1e-9);
        assert!((reading.baseline - 22.5).abs() < 1e-9);
        assert!((reading.actual - 7.5).abs() < 1e-9);
        assert_eq!(reading.sample_count, 2);
    }

    #[test]
    fn delay_reduction_empty_window_is_zero() {
        let reading = delay_reduction(&[], 1.5);
        assert_eq!(reading.actual, 0.0);
        assert_eq!(reading.sample_count, 0);
    }

    #[test]
    fn delay_reduction_ignores_nonpositive_delays() {
        let events = vec![
            event(Severity::Warning, json!({"delay": 0.0})),
            event(Severity::Warning, json!({"delay": 12.0})),
        ];
        let reading = delay_reduction(&events, 1.5);
        assert!((reading.observed_average - 12.0).abs() < 1e-9);
    }

    #[test]
    fn risk_score_delta_defaults_to_unit_risk() {
        let reading = risk_score_delta(&[], 1.2);
        assert!((reading.observed_average - 1.0).abs() < 1e-9);
        assert!((reading.actual - 0.2).abs() < 1e-9);
    }

    #[test]
    fn congestion_score_maps_severities() {
        let events = vec![
            event(Severity::Info, json!({})),
            event(Severity::Critical, json!({})),
        ];
        let reading = congestion_score(&events, 1.3);
        assert!((reading.observed_average - 0.6).abs() < 1e-9);
        assert!((reading.actual - 0.18).abs() < 1e-9);
    }

    #[test]
    fn voltage_stable_by_absence() {
        let stable = voltage_stable(&[]);
        assert_eq!(stable.actual, 1.0);
        assert!((stable.observed_average - 120.0).abs() < 1e-9);

        let unstable = voltage_stable(&[event(Severity::Critical, json!({"voltage": 0}))]);
        assert_eq!(unstable.actual, 0.0);
        assert_eq!(unstable.observed_average, 0.0);
    }

    #[test]
    fn polarity_comparisons() {
        assert!(passes(MetricPolarity::Reduction, 10.0, 10.0));
        assert!(!passes(MetricPolarity::Reduction, 9.9, 10.0));
        // Negative threshold means "a reduction of at least this much".
        assert!(passes(MetricPolarity::AbsoluteDelta, -0.3, -0.2));
        assert!(passes(MetricPolarity::AbsoluteDelta, 0.3, -0.2));
        assert!(!passes(MetricPolarity::AbsoluteDelta, 0.1, -0.2));
        assert!(passes(MetricPolarity::BooleanStability, 1.0, 1.0));
        assert!(!passes(MetricPolarity::BooleanStability, 0.0, 1.0));
    }

    #[test]
    fn polarity_lookup() {
        assert_eq!(polarity_for("delay_reduction"), MetricPolarity::Reduction);
        assert_eq!(polarity_for("risk_score_delta"), MetricPolarity::AbsoluteDelta);
        assert_eq!(polarity_for("voltage_stable"), MetricPolarity::BooleanStability);
    }
}
