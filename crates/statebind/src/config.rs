#![forbid(unsafe_code)]

//! Binding policy configuration.
//!
//! [`BindingConfig`] is plain data with sensible defaults. It can be built in
//! code, read from `STATEBIND_*` environment variables, or (with the
//! `policy-config` feature) parsed from TOML or JSON.
//!
//! ```toml
//! change_policy = "unconditional"
//! idle_turn_limit = 256
//! ```

use std::env;
use std::str::FromStr;

/// Default number of turns `run_until_idle` drains before reporting a livelock.
pub const DEFAULT_IDLE_TURN_LIMIT: usize = 1024;

/// Environment variable selecting the [`ChangePolicy`].
pub const ENV_CHANGE_POLICY: &str = "STATEBIND_CHANGE_POLICY";

/// Environment variable overriding [`BindingConfig::idle_turn_limit`].
pub const ENV_IDLE_TURN_LIMIT: &str = "STATEBIND_IDLE_TURN_LIMIT";

/// What a consumer does when one of its handles notifies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "policy-config",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum ChangePolicy {
    /// Re-read every tracked handle and re-render only if at least one value
    /// differs by identity from the last render.
    #[default]
    #[cfg_attr(feature = "policy-config", serde(alias = "compare"))]
    CompareBeforeEscalate,
    /// Re-render on every notification.
    Unconditional,
}

impl FromStr for ChangePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "compare" | "compare_before_escalate" => Ok(Self::CompareBeforeEscalate),
            "unconditional" | "always" => Ok(Self::Unconditional),
            _ => Err(ConfigError::InvalidValue {
                key: "change_policy",
                value: s.to_string(),
            }),
        }
    }
}

/// Error loading a [`BindingConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("idle_turn_limit must be at least 1")]
    ZeroTurnLimit,
    #[cfg(feature = "policy-config")]
    #[error("invalid TOML policy: {0}")]
    Toml(#[from] toml::de::Error),
    #[cfg(feature = "policy-config")]
    #[error("invalid JSON policy: {0}")]
    Json(#[from] serde_json::Error),
}

/// Binding behavior knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "policy-config",
    derive(serde::Serialize, serde::Deserialize),
    serde(default, deny_unknown_fields)
)]
pub struct BindingConfig {
    /// How handle notifications are turned into re-render requests.
    pub change_policy: ChangePolicy,
    /// Upper bound on turns drained by `run_until_idle`.
    pub idle_turn_limit: usize,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            change_policy: ChangePolicy::default(),
            idle_turn_limit: DEFAULT_IDLE_TURN_LIMIT,
        }
    }
}

impl BindingConfig {
    #[must_use]
    pub fn with_change_policy(mut self, policy: ChangePolicy) -> Self {
        self.change_policy = policy;
        self
    }

    #[must_use]
    pub fn with_idle_turn_limit(mut self, limit: usize) -> Self {
        self.idle_turn_limit = limit;
        self
    }

    /// Defaults overridden by `STATEBIND_CHANGE_POLICY` and
    /// `STATEBIND_IDLE_TURN_LIMIT` when set.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] for unparsable variables,
    /// [`ConfigError::ZeroTurnLimit`] for a zero limit.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_CHANGE_POLICY) {
            config.change_policy = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_IDLE_TURN_LIMIT) {
            config.idle_turn_limit = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "idle_turn_limit",
                value: raw.clone(),
            })?;
        }
        config.validate()
    }

    /// Parse a TOML policy document. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Toml`] on malformed input, plus validation errors.
    #[cfg(feature = "policy-config")]
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()
    }

    /// Parse a JSON policy document. Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Json`] on malformed input, plus validation errors.
    #[cfg(feature = "policy-config")]
    pub fn from_json_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(src)?;
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.idle_turn_limit == 0 {
            return Err(ConfigError::ZeroTurnLimit);
        }
        Ok(self)
    }
}
