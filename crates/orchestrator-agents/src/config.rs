//! Run configuration (§6) — resolved once per run from built-in defaults,
//! environment variables, and an explicit caller-supplied map, in that
//! precedence order. Closes a gap the original env-var-only loader this
//! replaces didn't have: an unrecognized key is a hard error here rather
//! than a silently-ignored no-op.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),
    #[error("key {key} expects {expected}, got {got:?}")]
    WrongType {
        key: String,
        expected: &'static str,
        got: String,
    },
    #[error("key {key} must be positive, got {value}")]
    NotPositive { key: String, value: String },
}

/// Resolved per-run configuration. See §6 for the authoritative defaults
/// table this mirrors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub max_coding_iterations: u32,
    pub max_advisor_invocations: u32,
    pub max_replans: u32,
    pub max_review_iterations: u32,
    pub max_verify_fix_cycles: u32,
    pub enable_advisor: bool,
    pub enable_replanning: bool,
    pub enable_learning: bool,
    pub agent_timeout_seconds: u64,
    pub agent_max_turns: u32,
    pub permission_mode: Option<String>,
    pub runtime: String,
    /// Resolution order: `runtime` default < `models["default"]` < `models[role]`.
    pub models: HashMap<String, String>,
    /// `None` is unbounded — the §5 default.
    pub concurrency_cap: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_coding_iterations: 5,
            max_advisor_invocations: 2,
            max_replans: 2,
            max_review_iterations: 1,
            max_verify_fix_cycles: 1,
            enable_advisor: true,
            enable_replanning: true,
            enable_learning: false,
            agent_timeout_seconds: 2700,
            agent_max_turns: 150,
            permission_mode: None,
            runtime: "default".to_string(),
            models: HashMap::new(),
            concurrency_cap: None,
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "max_coding_iterations",
    "max_advisor_invocations",
    "max_replans",
    "max_review_iterations",
    "max_verify_fix_cycles",
    "enable_advisor",
    "enable_replanning",
    "enable_learning",
    "agent_timeout_seconds",
    "agent_max_turns",
    "permission_mode",
    "runtime",
    "concurrency_cap",
];

impl RunConfig {
    pub fn model_for(&self, role: &str) -> String {
        self.models
            .get(role)
            .or_else(|| self.models.get("default"))
            .cloned()
            .unwrap_or_else(|| self.runtime.clone())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_seconds)
    }

    /// Merge order (§10.3/§14): built-in default < environment variable
    /// (`ORCHESTRATOR_<KEY>`) < explicit entry in `overrides`.
    pub fn from_map(overrides: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env();
        for (key, value) in overrides {
            config.apply_one(key, value)?;
        }
        Ok(config)
    }

    fn apply_env(&mut self) {
        for key in KNOWN_KEYS {
            if let Ok(value) = std::env::var(env_var_name(key)) {
                if let Err(e) = self.apply_one(key, &value) {
                    tracing::warn!(key, error = %e, "ignoring invalid environment override");
                }
            }
        }
        for (name, value) in std::env::vars() {
            if let Some(role) = name.strip_prefix("ORCHESTRATOR_MODELS_") {
                self.models.insert(role.to_lowercase(), value);
            }
        }
    }

    fn apply_one(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_coding_iterations" => self.max_coding_iterations = parse_positive_u32(key, value)?,
            "max_advisor_invocations" => self.max_advisor_invocations = parse_positive_u32(key, value)?,
            "max_replans" => self.max_replans = parse_positive_u32(key, value)?,
            "max_review_iterations" => self.max_review_iterations = parse_positive_u32(key, value)?,
            "max_verify_fix_cycles" => self.max_verify_fix_cycles = parse_positive_u32(key, value)?,
            "enable_advisor" => self.enable_advisor = parse_bool(key, value)?,
            "enable_replanning" => self.enable_replanning = parse_bool(key, value)?,
            "enable_learning" => self.enable_learning = parse_bool(key, value)?,
            "agent_timeout_seconds" => self.agent_timeout_seconds = parse_positive_u64(key, value)?,
            "agent_max_turns" => self.agent_max_turns = parse_positive_u32(key, value)?,
            "permission_mode" => self.permission_mode = Some(value.to_string()),
            "runtime" => self.runtime = value.to_string(),
            "concurrency_cap" => {
                self.concurrency_cap = if value.is_empty() || value.eq_ignore_ascii_case("unbounded") {
                    None
                } else {
                    Some(parse_positive_u32(key, value)? as usize)
                }
            }
            other if other.starts_with("models.") => {
                let role = other.trim_start_matches("models.").to_string();
                self.models.insert(role, value.to_string());
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

fn env_var_name(key: &str) -> String {
    format!("ORCHESTRATOR_{}", key.to_uppercase())
}

fn parse_positive_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    let parsed: u32 = value.parse().map_err(|_| ConfigError::WrongType {
        key: key.to_string(),
        expected: "a positive integer",
        got: value.to_string(),
    })?;
    if parsed == 0 {
        return Err(ConfigError::NotPositive {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

fn parse_positive_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    let parsed: u64 = value.parse().map_err(|_| ConfigError::WrongType {
        key: key.to_string(),
        expected: "a positive integer",
        got: value.to_string(),
    })?;
    if parsed == 0 {
        return Err(ConfigError::NotPositive {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ConfigError::WrongType {
            key: key.to_string(),
            expected: "true/false",
            got: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_config_table() {
        let config = RunConfig::default();
        assert_eq!(config.max_coding_iterations, 5);
        assert_eq!(config.max_advisor_invocations, 2);
        assert_eq!(config.max_replans, 2);
        assert_eq!(config.max_review_iterations, 1);
        assert_eq!(config.max_verify_fix_cycles, 1);
        assert!(config.enable_advisor);
        assert!(config.enable_replanning);
        assert!(!config.enable_learning);
        assert_eq!(config.agent_timeout_seconds, 2700);
        assert_eq!(config.agent_max_turns, 150);
        assert!(config.permission_mode.is_none());
        assert_eq!(config.concurrency_cap, None);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("bogus_key".to_string(), "1".to_string());
        let err = RunConfig::from_map(&overrides).unwrap_err();
        assert_eq!(err, ConfigError::UnknownKey("bogus_key".to_string()));
    }

    #[test]
    fn explicit_map_entry_overrides_default() {
        let mut overrides = HashMap::new();
        overrides.insert("max_coding_iterations".to_string(), "9".to_string());
        let config = RunConfig::from_map(&overrides).unwrap();
        assert_eq!(config.max_coding_iterations, 9);
    }

    #[test]
    fn zero_is_rejected_for_positive_keys() {
        let mut overrides = HashMap::new();
        overrides.insert("max_replans".to_string(), "0".to_string());
        let err = RunConfig::from_map(&overrides).unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive { .. }));
    }

    #[test]
    fn models_entries_are_keyed_by_role() {
        let mut overrides = HashMap::new();
        overrides.insert("models.coder".to_string(), "coder-model-x".to_string());
        overrides.insert("models.default".to_string(), "general-model".to_string());
        let config = RunConfig::from_map(&overrides).unwrap();
        assert_eq!(config.model_for("coder"), "coder-model-x");
        assert_eq!(config.model_for("reviewer"), "general-model");
    }

    #[test]
    fn model_for_falls_back_to_runtime_when_unconfigured() {
        let config = RunConfig::default();
        assert_eq!(config.model_for("coder"), "default");
    }
}
