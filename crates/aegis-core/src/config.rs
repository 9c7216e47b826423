//! Environment-driven engine configuration
//!
//! Missing or invalid mandatory values are fatal: `EngineConfig::from_env`
//! fails before anything connects, and the daemon exits non-zero.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use aegis_bus::BusBackendKind;

use crate::autonomy::AutonomyLevel;
use crate::error::EngineError;
use crate::metrics::BaselineFactors;

/// LLM provider settings for the planner chain. Absent endpoint/key simply
/// means the deterministic rule planner is the only provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    /// Provider names tried in order ("llm", "rules"). The rule planner is
    /// always appended as terminal fallback if the list omits it.
    pub provider_order: Vec<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            endpoint: None,
            api_key: None,
            model: String::new(),
            provider_order: default_provider_order(),
        }
    }
}

fn default_provider_order() -> Vec<String> {
    vec!["llm".to_string(), "rules".to_string()]
}

impl LlmConfig {
    /// Whether an HTTP provider can be constructed from this config.
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.api_key.is_some()
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bus backend (mandatory; single backend per process)
    pub bus_backend: BusBackendKind,
    /// NATS URL, consulted when the backend is `nats`
    pub nats_url: String,
    /// Event store connection string (mandatory), e.g. `mem://` or
    /// `surrealkv://.aegis/db`
    pub store_url: String,
    pub llm: LlmConfig,
    pub autonomy_initial: AutonomyLevel,
    /// Default verification window when an action does not set one
    pub verification_window_secs: u64,
    /// Defense verifier observation window
    pub defense_window_secs: u64,
    /// Threat deduplication window
    pub dedup_window_secs: u64,
    /// Threat deduplication radius
    pub dedup_radius_km: f64,
    /// Capacity of the proposer/assessor processed-id caches
    pub processed_cache_capacity: NonZeroUsize,
    pub baseline_factors: BaselineFactors,
}

impl EngineConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> crate::Result<Self> {
        let bus_backend = required("AEGIS_BUS_BACKEND")?
            .parse::<BusBackendKind>()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let store_url = required("AEGIS_STORE_URL")?;

        Ok(EngineConfig {
            bus_backend,
            nats_url: optional("AEGIS_NATS_URL").unwrap_or_else(|| "nats://127.0.0.1:4222".to_string()),
            store_url,
            llm: LlmConfig {
                endpoint: optional("AEGIS_LLM_ENDPOINT"),
                api_key: optional("AEGIS_LLM_API_KEY"),
                model: optional("AEGIS_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                provider_order: optional("AEGIS_LLM_PROVIDER_ORDER")
                    .map(|raw| {
                        raw.split(',')
                            .map(|p| p.trim().to_ascii_lowercase())
                            .filter(|p| !p.is_empty())
                            .collect()
                    })
                    .unwrap_or_else(default_provider_order),
            },
            autonomy_initial: parse_or("AEGIS_AUTONOMY_INITIAL", AutonomyLevel::Normal)?,
            verification_window_secs: parse_or("AEGIS_VERIFICATION_WINDOW_SECS", 300u64)?,
            defense_window_secs: parse_or("AEGIS_DEFENSE_WINDOW_SECS", 600u64)?,
            dedup_window_secs: parse_or("AEGIS_DEDUP_WINDOW_SECS", 300u64)?,
            dedup_radius_km: parse_or("AEGIS_DEDUP_RADIUS_KM", 5.0f64)?,
            processed_cache_capacity: parse_or(
                "AEGIS_PROCESSED_CACHE_CAPACITY",
                NonZeroUsize::new(4096).expect("nonzero literal"),
            )?,
            baseline_factors: BaselineFactors::default(),
        })
    }

    pub fn verification_window(&self) -> Duration {
        Duration::from_secs(self.verification_window_secs)
    }
}

fn required(var: &str) -> crate::Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(EngineError::Config(format!(
            "{var} environment variable is required"
        ))),
    }
}

fn optional(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(var: &str, default: T) -> crate::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(var) {
        Some(raw) => raw.parse::<T>().map_err(|e| {
            EngineError::Config(format!("invalid value for {var}: '{raw}' ({e})"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests sharing AEGIS_* variables run in one function: cargo runs test
    // functions in parallel threads and the environment is process-global.
    #[test]
    fn from_env_lifecycle() {
        std::env::remove_var("AEGIS_BUS_BACKEND");
        std::env::remove_var("AEGIS_STORE_URL");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        std::env::set_var("AEGIS_BUS_BACKEND", "memory");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("AEGIS_STORE_URL"));

        std::env::set_var("AEGIS_STORE_URL", "mem://");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.verification_window_secs, 300);
        assert_eq!(config.defense_window_secs, 600);
        assert_eq!(config.dedup_window_secs, 300);
        assert!((config.dedup_radius_km - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.processed_cache_capacity.get(), 4096);
        assert_eq!(config.autonomy_initial, AutonomyLevel::Normal);
        assert!(!config.llm.is_configured());
        assert_eq!(config.llm.provider_order, vec!["llm", "rules"]);

        std::env::remove_var("AEGIS_BUS_BACKEND");
        std::env::remove_var("AEGIS_STORE_URL");
    }

    #[test]
    fn invalid_number_is_fatal() {
        assert!(parse_or::<u64>("AEGIS_TEST_BAD_NUMBER", 1).is_ok());
        std::env::set_var("AEGIS_TEST_BAD_NUMBER", "not-a-number");
        assert!(parse_or::<u64>("AEGIS_TEST_BAD_NUMBER", 1).is_err());
        std::env::remove_var("AEGIS_TEST_BAD_NUMBER");
    }
}
