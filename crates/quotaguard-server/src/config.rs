//! Service configuration

use quotaguard_common::{QuotaError, Result, SubscriptionSnapshot, Tier};
use quotaguard_meter::config::{parse_var, string_var};
use quotaguard_meter::{MeterConfig, StaticSubscriptionResolver};
use serde::{Deserialize, Serialize};

/// HTTP service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `tenant=tier[:status]` assignments for the static resolver
    pub tenant_tiers: Option<String>,
    /// Tier granted to tenants without an assignment; unset denies them
    pub default_tier: Option<Tier>,
    pub meter: MeterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
            tenant_tiers: None,
            default_tier: None,
            meter: MeterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `.env` and the environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self {
            meter: MeterConfig::from_lookup(&lookup)?,
            ..Self::default()
        };

        // Platform-assigned PORT wins over ours
        if let Some(port) = parse_var(&lookup, "QUOTAGUARD_PORT")? {
            cfg.port = port;
        }
        if let Some(port) = parse_var(&lookup, "PORT")? {
            cfg.port = port;
        }
        if let Some(host) = string_var(&lookup, "QUOTAGUARD_HOST") {
            cfg.host = host;
        }
        cfg.tenant_tiers = string_var(&lookup, "QUOTAGUARD_TENANT_TIERS");
        cfg.default_tier = parse_var(&lookup, "QUOTAGUARD_DEFAULT_TIER")?;

        Ok(cfg)
    }

    /// Static resolver seeded from the configured assignments
    pub fn resolver(&self) -> Result<StaticSubscriptionResolver> {
        let resolver = match &self.tenant_tiers {
            Some(spec) => StaticSubscriptionResolver::parse_assignments(spec)
                .map_err(|e| QuotaError::Config(format!("QUOTAGUARD_TENANT_TIERS: {}", e)))?,
            None => StaticSubscriptionResolver::new(),
        };
        Ok(match self.default_tier {
            Some(tier) => resolver.with_fallback(SubscriptionSnapshot::active(tier)),
            None => resolver,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
