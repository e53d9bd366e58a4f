//! Meter configuration

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use quotaguard_common::{QuotaError, Result};
use serde::{Deserialize, Serialize};

use crate::meter::MeterOptions;
use crate::subscription::StatusPolicy;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Bound on every store call, in milliseconds
    pub store_timeout_ms: u64,
    /// Bound on the subscription lookup, in milliseconds
    pub resolver_timeout_ms: u64,
    /// Extra attempts when a period reset races an increment
    pub max_conflict_retries: u32,
    /// `past_due` keeps the paid tier's limits
    pub past_due_grace: bool,
    /// `trialing` counts as active
    pub trialing_is_active: bool,
    /// JSON quota table overriding the built-in one
    pub policy_path: Option<PathBuf>,
    /// Redis URL; in-memory backends when unset
    pub redis_url: Option<String>,
    /// Redis key namespace
    pub key_prefix: String,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 2000,
            resolver_timeout_ms: 2000,
            max_conflict_retries: 3,
            past_due_grace: false,
            trialing_is_active: false,
            policy_path: None,
            redis_url: None,
            key_prefix: "quotaguard".to_string(),
        }
    }
}

impl MeterConfig {
    /// Load from `.env` and `QUOTAGUARD_*` environment variables
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&lookup, "QUOTAGUARD_STORE_TIMEOUT_MS")? {
            cfg.store_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUOTAGUARD_RESOLVER_TIMEOUT_MS")? {
            cfg.resolver_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "QUOTAGUARD_MAX_CONFLICT_RETRIES")? {
            cfg.max_conflict_retries = v;
        }
        if let Some(v) = bool_var(&lookup, "QUOTAGUARD_PAST_DUE_GRACE")? {
            cfg.past_due_grace = v;
        }
        if let Some(v) = bool_var(&lookup, "QUOTAGUARD_TRIALING_IS_ACTIVE")? {
            cfg.trialing_is_active = v;
        }
        if let Some(path) = string_var(&lookup, "QUOTAGUARD_POLICY_PATH") {
            cfg.policy_path = Some(PathBuf::from(path));
        }
        if let Some(url) = string_var(&lookup, "QUOTAGUARD_REDIS_URL") {
            cfg.redis_url = Some(url);
        }
        if let Some(prefix) = string_var(&lookup, "QUOTAGUARD_KEY_PREFIX") {
            cfg.key_prefix = prefix;
        }

        if cfg.store_timeout_ms == 0 || cfg.resolver_timeout_ms == 0 {
            return Err(QuotaError::Config("timeouts must be greater than zero".to_string()));
        }
        Ok(cfg)
    }

    pub fn status_policy(&self) -> StatusPolicy {
        StatusPolicy {
            past_due_grace: self.past_due_grace,
            trialing_is_active: self.trialing_is_active,
        }
    }

    pub fn meter_options(&self) -> MeterOptions {
        MeterOptions {
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            resolver_timeout: Duration::from_millis(self.resolver_timeout_ms),
            max_conflict_retries: self.max_conflict_retries,
            status_policy: self.status_policy(),
        }
    }
}

/// Non-empty, trimmed value of a variable
pub fn string_var<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parsed value of a variable; a malformed value is an error, not a default
pub fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    string_var(lookup, key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| QuotaError::Config(format!("{}={}: {}", key, raw, e)))
        })
        .transpose()
}

pub fn bool_var<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    string_var(lookup, key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(QuotaError::Config(format!("{}={}: expected a boolean", key, raw))),
        })
        .transpose()
}
