//! Fix planner providers
//!
//! The proposer asks a chain of providers for a remediation draft: an HTTP
//! LLM provider when configured, then the deterministic rule planner as the
//! terminal fallback. Provider output is validated against the fix schema
//! before it is accepted; anything malformed falls through to the next
//! provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use aegis_domain::fix::{
    ActionTarget, ActionType, ActionVerification, ExpectedImpact, FixAction, FixSource, RiskLevel,
};
use aegis_domain::{topics, Envelope, Severity};

use crate::config::LlmConfig;
use crate::error::EngineError;

/// A remediation draft: everything a fix needs except its identifiers,
/// which the proposer mints.
#[derive(Debug, Clone)]
pub struct FixDraft {
    pub title: String,
    pub summary: String,
    pub actions: Vec<FixAction>,
    pub risk_level: RiskLevel,
    pub expected_impact: ExpectedImpact,
    pub source: FixSource,
}

impl FixDraft {
    /// Drafts must carry at least one action from the closed type set.
    fn validate(&self) -> crate::Result<()> {
        if self.title.is_empty() {
            return Err(EngineError::Planner("draft without title".to_string()));
        }
        if self.actions.is_empty() {
            return Err(EngineError::Planner("draft without actions".to_string()));
        }
        if self.actions.iter().any(|a| !a.action_type.is_known()) {
            return Err(EngineError::Planner(
                "draft carries an unknown action type".to_string(),
            ));
        }
        Ok(())
    }
}

/// A single fix-draft provider.
#[async_trait]
pub trait FixPlanner: Send + Sync {
    fn name(&self) -> &str;

    async fn propose_fix(&self, trigger_topic: &str, trigger: &Envelope)
        -> crate::Result<FixDraft>;
}

// ---------------------------------------------------------------------------
// PlannerChain
// ---------------------------------------------------------------------------

/// Ordered provider chain; first validated draft wins.
pub struct PlannerChain {
    providers: Vec<Arc<dyn FixPlanner>>,
}

impl PlannerChain {
    /// Build the chain from the configured provider order. The rule planner
    /// is appended as terminal fallback when the order omits it, so the
    /// chain can always produce a draft.
    pub fn from_config(llm: &LlmConfig, default_window_secs: u64) -> Self {
        let mut providers: Vec<Arc<dyn FixPlanner>> = Vec::new();
        let mut has_rules = false;
        for name in &llm.provider_order {
            match name.as_str() {
                "llm" => {
                    if let (Some(endpoint), Some(api_key)) = (&llm.endpoint, &llm.api_key) {
                        providers.push(Arc::new(HttpLlmPlanner::new(
                            endpoint.clone(),
                            api_key.clone(),
                            llm.model.clone(),
                        )));
                    }
                }
                "rules" => {
                    providers.push(Arc::new(RulePlanner::new(default_window_secs)));
                    has_rules = true;
                }
                other => warn!(provider = other, "unknown planner provider, skipping"),
            }
        }
        if !has_rules {
            providers.push(Arc::new(RulePlanner::new(default_window_secs)));
        }
        PlannerChain { providers }
    }

    pub fn rules_only(default_window_secs: u64) -> Self {
        PlannerChain {
            providers: vec![Arc::new(RulePlanner::new(default_window_secs))],
        }
    }

    #[cfg(test)]
    pub fn custom(providers: Vec<Arc<dyn FixPlanner>>) -> Self {
        PlannerChain { providers }
    }

    /// Try each provider in order; each failure (including a draft that
    /// fails validation) falls through to the next.
    pub async fn propose_fix(
        &self,
        trigger_topic: &str,
        trigger: &Envelope,
    ) -> crate::Result<FixDraft> {
        let mut last_error = None;
        for provider in &self.providers {
            match provider.propose_fix(trigger_topic, trigger).await {
                Ok(draft) => match draft.validate() {
                    Ok(()) => {
                        debug!(provider = provider.name(), "draft accepted");
                        return Ok(draft);
                    }
                    Err(e) => {
                        warn!(provider = provider.name(), error = %e, "draft rejected, falling through");
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "provider failed, falling through");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::Planner("no providers configured".to_string())))
    }
}

// ---------------------------------------------------------------------------
// RulePlanner - deterministic terminal fallback
// ---------------------------------------------------------------------------

/// Deterministic rule planner: maps the trigger topic to a remediation
/// template. Always succeeds, so the chain never comes up empty.
pub struct RulePlanner {
    default_window_secs: u64,
}

impl RulePlanner {
    pub fn new(default_window_secs: u64) -> Self {
        RulePlanner {
            default_window_secs,
        }
    }

    fn verification(&self, metric_name: &str, threshold: f64) -> Option<ActionVerification> {
        Some(ActionVerification {
            metric_name: metric_name.to_string(),
            threshold,
            window_seconds: self.default_window_secs,
        })
    }
}

#[async_trait]
impl FixPlanner for RulePlanner {
    fn name(&self) -> &str {
        "rules"
    }

    async fn propose_fix(
        &self,
        trigger_topic: &str,
        trigger: &Envelope,
    ) -> crate::Result<FixDraft> {
        let details = &trigger.details;
        let sector = trigger.sector_id.clone();

        let draft = match trigger_topic {
            topics::POWER_FAILURE => FixDraft {
                title: format!("Restore power in {sector}"),
                summary: format!(
                    "Activate backup systems and re-energize {sector} after the reported failure"
                ),
                actions: vec![FixAction {
                    action_type: ActionType::PowerRecoverySim,
                    target: ActionTarget {
                        sector_id: Some(sector),
                        ..Default::default()
                    },
                    params: to_map(json!({"strategy": "backup-first", "grid_isolation": true})),
                    verification: self.verification("voltage_stable", 1.0),
                }],
                risk_level: RiskLevel::Med,
                expected_impact: ExpectedImpact {
                    risk_score_delta: Some(-0.3),
                    ..Default::default()
                },
                source: FixSource::Rules,
            },
            topics::TRANSIT_DISRUPTION_RISK | topics::TRANSIT_HOTSPOT => {
                let route_id = details
                    .get("route_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN")
                    .to_string();
                FixDraft {
                    title: format!("Reroute {route_id} around disruption"),
                    summary: format!("Temporary reroute of {route_id} to cut accumulated delay"),
                    actions: vec![FixAction {
                        action_type: ActionType::TransitRerouteSim,
                        target: ActionTarget {
                            route_id: Some(route_id),
                            area_bbox: details.get("area_bbox").cloned(),
                            ..Default::default()
                        },
                        params: to_map(json!({"expected_delay_reduction": 15.0})),
                        verification: self.verification("delay_reduction", 10.0),
                    }],
                    risk_level: RiskLevel::Med,
                    expected_impact: ExpectedImpact {
                        delay_reduction: Some(15.0),
                        ..Default::default()
                    },
                    source: FixSource::Rules,
                }
            }
            topics::AIRSPACE_CONFLICT_DETECTED | topics::AIRSPACE_HOTSPOT_DETECTED => FixDraft {
                title: format!("Mitigate airspace congestion over {sector}"),
                summary: "Flow-rate restriction and altitude separation in the hotspot".to_string(),
                actions: vec![FixAction {
                    action_type: ActionType::AirspaceMitigationSim,
                    target: ActionTarget {
                        sector_id: Some(sector),
                        flight_id: details
                            .get("flight_id")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                        ..Default::default()
                    },
                    params: to_map(json!({"flow_rate_reduction": 0.25})),
                    verification: self.verification("congestion_score", 0.1),
                }],
                risk_level: RiskLevel::Med,
                expected_impact: ExpectedImpact {
                    risk_score_delta: Some(-0.2),
                    ..Default::default()
                },
                source: FixSource::Rules,
            },
            _ => FixDraft {
                // Generic advisory for any other critical trigger.
                title: format!("Issue risk advisory for {sector}"),
                summary: "Public advisory and routing guidance for the affected area".to_string(),
                actions: vec![FixAction {
                    action_type: ActionType::TrafficAdvisorySim,
                    target: ActionTarget {
                        sector_id: Some(sector),
                        area_bbox: details.get("area_bbox").cloned(),
                        ..Default::default()
                    },
                    params: Map::new(),
                    verification: self.verification("risk_score_delta", 0.1),
                }],
                risk_level: RiskLevel::Low,
                expected_impact: ExpectedImpact {
                    risk_score_delta: Some(-0.1),
                    ..Default::default()
                },
                source: FixSource::Rules,
            },
        };

        Ok(draft)
    }
}

fn to_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// HttpLlmPlanner - OpenAI-compatible chat endpoint
// ---------------------------------------------------------------------------

const FIX_PROMPT: &str = r#"You are a crisis remediation planner. Given the JSON event below, respond with ONLY a JSON object of the form:
{"title": string, "summary": string, "risk_level": "low"|"med"|"high",
 "actions": [{"type": "transit-reroute-sim"|"traffic-advisory-sim"|"airspace-mitigation-sim"|"power-recovery-sim",
              "target": {"route_id"?, "sector_id"?, "area_bbox"?, "stop_id"?, "flight_id"?},
              "params": object,
              "verification": {"metric_name": string, "threshold": number, "window_seconds": number}}],
 "expected_impact": {"delay_reduction"?: number, "risk_score_delta"?: number}}
All actions are simulations; never propose anything outside the listed types.

Event:
"#;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct DraftWire {
    title: String,
    summary: String,
    risk_level: RiskLevel,
    actions: Vec<FixAction>,
    #[serde(default)]
    expected_impact: ExpectedImpact,
}

/// Planner backed by an OpenAI-compatible `chat/completions` endpoint.
pub struct HttpLlmPlanner {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpLlmPlanner {
    pub fn new(endpoint: String, api_key: String, model: String) -> Self {
        HttpLlmPlanner {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl FixPlanner for HttpLlmPlanner {
    fn name(&self) -> &str {
        "llm-http"
    }

    async fn propose_fix(
        &self,
        _trigger_topic: &str,
        trigger: &Envelope,
    ) -> crate::Result<FixDraft> {
        let event_json = serde_json::to_string_pretty(trigger)
            .map_err(|e| EngineError::Planner(e.to_string()))?;
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));

        info!(model = %self.model, "requesting fix draft from LLM provider");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": "You generate structured crisis remediations in JSON."},
                    {"role": "user", "content": format!("{FIX_PROMPT}{event_json}")},
                ],
                "temperature": 0.7,
                "max_tokens": 1000,
            }))
            .send()
            .await
            .map_err(|e| EngineError::Planner(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(EngineError::Planner(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Planner(format!("bad response body: {e}")))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| EngineError::Planner("empty choices".to_string()))?;

        let raw = extract_json_object(content)
            .ok_or_else(|| EngineError::Planner("no JSON object in response".to_string()))?;
        let wire: DraftWire = serde_json::from_str(&raw)
            .map_err(|e| EngineError::Planner(format!("draft failed schema: {e}")))?;

        Ok(FixDraft {
            title: wire.title,
            summary: wire.summary,
            actions: wire.actions,
            risk_level: wire.risk_level,
            expected_impact: wire.expected_impact,
            source: FixSource::LlmPrimary,
        })
    }
}

/// Extract the outermost JSON object from free-form model output.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Recovery plan fallback
// ---------------------------------------------------------------------------

/// Deterministic recovery plan for a power failure, graded by severity.
/// Used when no LLM provider is configured (and as the terminal fallback).
pub fn fallback_recovery_plan(trigger: &Envelope) -> Value {
    let sector = &trigger.sector_id;
    let plan_num = Uuid::new_v4().simple().to_string()[..3].to_uppercase();
    let plan_id = format!("RP-{}-{}", Utc::now().format("%Y"), plan_num);
    let plan_name = format!(
        "{} Power Restoration Plan",
        title_case(&sector.replace('-', " "))
    );

    let (steps, hours): (Vec<&str>, i64) = match trigger.severity {
        Severity::Critical => (
            vec![
                "Immediate safety shutdown of affected sector",
                "Activate emergency backup power systems",
                "Notify emergency response team",
                "Isolate sector from main grid",
                "Begin damage assessment",
                "Coordinate restoration with maintenance team",
            ],
            4,
        ),
        Severity::Moderate => (
            vec![
                "Assess circuit integrity",
                "Isolate affected circuits",
                "Activate backup power systems",
                "Verify backup system operation",
                "Restore primary power gradually",
                "Monitor system stability",
            ],
            3,
        ),
        _ => (
            vec![
                "Monitor power levels continuously",
                "Investigate voltage fluctuation cause",
                "Apply voltage regulation",
                "Verify system returns to normal",
            ],
            1,
        ),
    };

    let assigned: Vec<&str> = if trigger.severity >= Severity::Moderate {
        vec!["agent-001", "agent-002"]
    } else {
        vec!["agent-001"]
    };

    json!({
        "plan_id": plan_id,
        "plan_name": plan_name,
        "status": "draft",
        "steps": steps,
        "estimated_completion": (Utc::now() + Duration::hours(hours))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "assigned_agents": assigned,
        "reasoning": format!(
            "Fallback plan generated for {} severity event in {sector}",
            trigger.severity
        ),
    })
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
