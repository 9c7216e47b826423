//! Defense threat assessor
//!
//! Enriches each detected threat with an assessment and proposes the
//! informational actions the defense actuator will carry out. Assessment
//! follows the same provider-chain pattern as the fix planner: an HTTP LLM
//! provider when configured, the deterministic rule assessor as terminal
//! fallback.
//!
//! The assessor also owns the city-wide defense posture: the current level
//! feeds into every assessment, and when an assessment recommends a higher
//! level than the current one, a `defense.posture.changed` event goes out
//! and the tracked posture moves up. Assessments never lower the posture;
//! de-escalation is an operator decision outside this chain.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use serde::Deserialize;
use serde_json::{json, Map};
use tracing::{info, warn};

use aegis_bus::{EventHandler, MessageBus};
use aegis_domain::threat::{
    DefenseActionDetails, DefenseActionType, DefensePosture, PostureChange, ThreatAssessment,
    ThreatDetails, ThreatSeverity, DEFENSE_DISCLAIMER,
};
use aegis_domain::{topics, Envelope, Severity};

use crate::config::LlmConfig;
use crate::error::EngineError;

/// Assessment produced by a provider.
#[derive(Debug, Clone, Deserialize)]
pub struct AssessmentDraft {
    pub assessment_score: f64,
    pub risk_level: String,
    pub notes: String,
    #[serde(default)]
    pub recommended_actions: Vec<DefenseActionType>,
    #[serde(default)]
    pub recommended_posture: DefensePosture,
}

/// A single assessment provider. `current_posture` is the level in effect
/// when the threat arrived; recommendations are made relative to it.
#[async_trait]
pub trait ThreatAssessor: Send + Sync {
    fn name(&self) -> &str;

    async fn assess(
        &self,
        threat: &ThreatDetails,
        current_posture: DefensePosture,
    ) -> crate::Result<AssessmentDraft>;
}

// ---------------------------------------------------------------------------
// RuleAssessor - deterministic terminal fallback
// ---------------------------------------------------------------------------

/// Deterministic assessor: score tracks detection confidence, actions scale
/// with severity. Monitoring is always boosted; high severity raises the
/// alert level; critical adds a public advisory and locks autonomy. The
/// recommended posture tracks severity but never falls below the current
/// level.
pub struct RuleAssessor;

fn posture_for_severity(severity: ThreatSeverity) -> DefensePosture {
    match severity {
        ThreatSeverity::Low => DefensePosture::Normal,
        ThreatSeverity::Med => DefensePosture::Elevated,
        ThreatSeverity::High => DefensePosture::HeightenedAlert,
        ThreatSeverity::Critical => DefensePosture::Critical,
    }
}

#[async_trait]
impl ThreatAssessor for RuleAssessor {
    fn name(&self) -> &str {
        "rules"
    }

    async fn assess(
        &self,
        threat: &ThreatDetails,
        current_posture: DefensePosture,
    ) -> crate::Result<AssessmentDraft> {
        let mut recommended = vec![DefenseActionType::MonitoringBoost];
        if threat.severity >= ThreatSeverity::High {
            recommended.push(DefenseActionType::RaiseAlertLevel);
        }
        if threat.severity == ThreatSeverity::Critical {
            recommended.push(DefenseActionType::PublicAdvisory);
            recommended.push(DefenseActionType::AutonomyLock);
        }

        let risk_level = match threat.severity {
            ThreatSeverity::Critical => "critical",
            ThreatSeverity::High => "high",
            ThreatSeverity::Med => "med",
            ThreatSeverity::Low => "low",
        };

        Ok(AssessmentDraft {
            assessment_score: threat.confidence_score,
            risk_level: risk_level.to_string(),
            notes: format!(
                "Rule assessment: {} threat at confidence {:.2} from {} source(s)",
                risk_level,
                threat.confidence_score,
                threat.sources.len()
            ),
            recommended_actions: recommended,
            recommended_posture: posture_for_severity(threat.severity).max(current_posture),
        })
    }
}

// ---------------------------------------------------------------------------
// HttpLlmAssessor
// ---------------------------------------------------------------------------

const ASSESS_PROMPT: &str = r#"You are an informational civil-defense analyst. Given the threat JSON below, respond with ONLY a JSON object:
{"assessment_score": number in [0,1], "risk_level": "low"|"med"|"high"|"critical",
 "notes": string,
 "recommended_actions": ["raise-alert-level"|"public-advisory"|"monitoring-boost"|"autonomy-lock"],
 "recommended_posture": "normal"|"elevated"|"heightened_alert"|"critical"}
All actions are informational only; never recommend anything else. Never
recommend a posture below the current one.

"#;

/// Assessor backed by an OpenAI-compatible `chat/completions` endpoint.
pub struct HttpLlmAssessor {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpLlmAssessor {
    pub fn from_config(llm: &LlmConfig) -> Option<Self> {
        match (&llm.endpoint, &llm.api_key) {
            (Some(endpoint), Some(api_key)) => Some(HttpLlmAssessor {
                client: reqwest::Client::new(),
                endpoint: endpoint.clone(),
                api_key: api_key.clone(),
                model: llm.model.clone(),
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl ThreatAssessor for HttpLlmAssessor {
    fn name(&self) -> &str {
        "llm-http"
    }

    async fn assess(
        &self,
        threat: &ThreatDetails,
        current_posture: DefensePosture,
    ) -> crate::Result<AssessmentDraft> {
        let threat_json = serde_json::to_string_pretty(&threat.to_value()?)
            .map_err(|e| EngineError::Planner(e.to_string()))?;
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let prompt =
            format!("{ASSESS_PROMPT}Current city posture: {current_posture}\n\nThreat:\n{threat_json}");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": "You generate structured threat assessments in JSON."},
                    {"role": "user", "content": prompt},
                ],
                "temperature": 0.3,
                "max_tokens": 500,
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

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Planner(format!("bad response body: {e}")))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EngineError::Planner("empty choices".to_string()))?;

        let start = content
            .find('{')
            .ok_or_else(|| EngineError::Planner("no JSON object in response".to_string()))?;
        let end = content
            .rfind('}')
            .ok_or_else(|| EngineError::Planner("no JSON object in response".to_string()))?;
        serde_json::from_str(&content[start..=end])
            .map_err(|e| EngineError::Planner(format!("assessment failed schema: {e}")))
    }
}

// ---------------------------------------------------------------------------
// DefenseAssessor agent
// ---------------------------------------------------------------------------

/// Assesses detected threats, proposes informational actions, and tracks
/// the city-wide defense posture.
pub struct DefenseAssessor {
    bus: Arc<dyn MessageBus>,
    providers: Vec<Arc<dyn ThreatAssessor>>,
    processed: Mutex<LruCache<String, ()>>,
    // Process-local: one assessor is the single posture writer.
    posture: Mutex<DefensePosture>,
    source_id: String,
}

impl DefenseAssessor {
    /// Provider chain ends with the rule assessor, so assessment always
    /// completes. Posture starts at `normal`.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        llm: &LlmConfig,
        processed_capacity: NonZeroUsize,
    ) -> Arc<Self> {
        let mut providers: Vec<Arc<dyn ThreatAssessor>> = Vec::new();
        if let Some(http) = HttpLlmAssessor::from_config(llm) {
            providers.push(Arc::new(http));
        }
        providers.push(Arc::new(RuleAssessor));

        Arc::new(DefenseAssessor {
            bus,
            providers,
            processed: Mutex::new(LruCache::new(processed_capacity)),
            posture: Mutex::new(DefensePosture::Normal),
            source_id: "defense-assessor".to_string(),
        })
    }

    pub async fn wire(self: &Arc<Self>) -> crate::Result<()> {
        self.bus
            .subscribe(topics::DEFENSE_THREAT_DETECTED, self.clone())
            .await?;
        Ok(())
    }

    /// Posture currently in effect.
    pub fn current_posture(&self) -> DefensePosture {
        *self.posture.lock().expect("posture lock poisoned")
    }

    async fn assess_with_fallback(
        &self,
        threat: &ThreatDetails,
        current_posture: DefensePosture,
    ) -> crate::Result<AssessmentDraft> {
        let mut last_error = None;
        for provider in &self.providers {
            match provider.assess(threat, current_posture).await {
                Ok(draft) => return Ok(draft),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "assessor failed, falling through");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::Planner("no assessors configured".to_string())))
    }

    /// Raise the tracked posture when an assessment recommends a higher
    /// level, announcing the change on the bus. Assessments never lower it.
    async fn apply_posture(
        &self,
        threat: &ThreatDetails,
        recommended: DefensePosture,
        sector: &str,
    ) -> crate::Result<()> {
        let previous = {
            let mut posture = self.posture.lock().expect("posture lock poisoned");
            if recommended <= *posture {
                return Ok(());
            }
            let previous = *posture;
            *posture = recommended;
            previous
        };

        let change = PostureChange {
            posture_id: PostureChange::mint_id(Utc::now()),
            previous_posture: previous,
            new_posture: recommended,
            change_reason: Some(format!(
                "Threat {} assessed at {} severity",
                threat.threat_id,
                threat.severity.as_str()
            )),
            changed_by: self.source_id.clone(),
            changed_at: Utc::now(),
            extra: Map::new(),
        };

        let envelope = Envelope::new(
            &self.source_id,
            Severity::Warning,
            sector,
            format!("Defense posture changed to {recommended}"),
        )
        .with_correlation(&threat.threat_id)
        .with_details(change.to_value()?);
        self.bus
            .publish(topics::DEFENSE_POSTURE_CHANGED, &envelope)
            .await?;
        info!(previous = %previous, current = %recommended, "defense posture raised");
        Ok(())
    }

    async fn on_threat_detected(&self, envelope: &Envelope) -> crate::Result<()> {
        let threat = ThreatDetails::from_value(&envelope.details)?;

        {
            let mut processed = self.processed.lock().expect("processed lock poisoned");
            if processed.contains(&threat.threat_id) {
                return Ok(());
            }
            processed.put(threat.threat_id.clone(), ());
        }

        let current_posture = self.current_posture();
        info!(
            threat_id = %threat.threat_id,
            confidence = threat.confidence_score,
            posture = %current_posture,
            "assessing threat"
        );
        let draft = self.assess_with_fallback(&threat, current_posture).await?;

        let assessment = ThreatAssessment {
            threat_id: threat.threat_id.clone(),
            assessment_score: Some(draft.assessment_score),
            risk_level: Some(draft.risk_level.clone()),
            assessment_notes: Some(draft.notes.clone()),
            assessed_by: self.source_id.clone(),
            assessed_at: Utc::now(),
            recommended_actions: draft.recommended_actions.clone(),
            recommended_posture: draft.recommended_posture,
            extra: Map::new(),
        };

        let assessed = Envelope::new(
            &self.source_id,
            Severity::Moderate,
            &envelope.sector_id,
            format!(
                "Threat {} assessed as {} risk",
                threat.threat_id, draft.risk_level
            ),
        )
        .with_correlation(&threat.threat_id)
        .with_details(serde_json::to_value(&assessment).map_err(aegis_domain::DomainError::from)?);
        self.bus
            .publish(topics::DEFENSE_THREAT_ASSESSED, &assessed)
            .await?;

        self.apply_posture(&threat, draft.recommended_posture, &envelope.sector_id)
            .await?;

        // The informational chain self-approves: propose, then approve, per
        // recommended action. The actuator keys idempotency off action_id.
        for action_type in draft.recommended_actions {
            let action = DefenseActionDetails {
                action_id: DefenseActionDetails::mint_id(Utc::now()),
                threat_id: threat.threat_id.clone(),
                action_type,
                params: Map::new(),
                proposed_by: self.source_id.clone(),
                disclaimer: DEFENSE_DISCLAIMER.to_string(),
                extra: Map::new(),
            };
            let action_value = action.to_value()?;

            let proposed = Envelope::new(
                &self.source_id,
                Severity::Info,
                &envelope.sector_id,
                format!("Defense action {} proposed: {}", action.action_id, action.action_type),
            )
            .with_correlation(&threat.threat_id)
            .with_details(action_value.clone());
            self.bus
                .publish(topics::DEFENSE_ACTION_PROPOSED, &proposed)
                .await?;

            let approved = Envelope::new(
                &self.source_id,
                Severity::Info,
                &envelope.sector_id,
                format!("Defense action {} approved", action.action_id),
            )
            .with_correlation(&threat.threat_id)
            .with_details(action_value);
            self.bus
                .publish(topics::DEFENSE_ACTION_APPROVED, &approved)
                .await?;
        }

        info!(threat_id = %threat.threat_id, "threat assessed");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for DefenseAssessor {
    async fn handle(&self, topic: &str, envelope: Envelope) {
        if let Err(e) = self.on_threat_detected(&envelope).await {
            warn!(topic, error = %e, "defense assessor handler failed");
        }
    }
}
