//! # QuotaGuard Meter
//!
//! Usage metering and quota enforcement for multi-tenant SaaS plans.
//!
//! ## Decision flow
//!
//! ```text
//! resolve tier -> load or create record -> roll period over -> check limit -> increment + audit
//! ```
//!
//! Where:
//! - the tier comes from an external [`SubscriptionResolver`]
//! - ceilings come from an immutable [`QuotaPolicy`]
//! - the check and the increment are a single atomic [`UsageStore`] operation
//! - every failure path denies

pub mod audit;
pub mod config;
pub mod meter;
pub mod period;
pub mod policy;
pub mod store;
pub mod subscription;

pub use audit::{AuditAction, AuditDecision, AuditEntry, AuditError, UsageAuditLog};
pub use config::MeterConfig;
pub use meter::{ConsumeResult, Decision, DenialReason, MeterMetrics, MeterOptions, UsageMeter};
pub use period::BillingPeriodManager;
pub use policy::QuotaPolicy;
pub use store::UsageStore;
pub use subscription::{ResolverError, StaticSubscriptionResolver, StatusPolicy, SubscriptionResolver};

use std::sync::Arc;

use quotaguard_common::Result;
use tracing::info;

use audit::{InMemoryAuditLog, RedisAuditLog, TracingAuditLog};
use store::{InMemoryUsageStore, RedisUsageStore};

/// Which persistence backend a [`QuotaGuard`] runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Redis,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Memory => "memory",
            Backend::Redis => "redis",
        }
    }
}

/// A fully wired meter
pub struct QuotaGuard {
    meter: Arc<UsageMeter>,
    backend: Backend,
}

impl QuotaGuard {
    /// Wire policy, store and audit log from configuration
    ///
    /// Redis backs both the store and the audit log when a URL is configured.
    pub async fn from_config(
        config: &MeterConfig,
        resolver: Arc<dyn SubscriptionResolver>,
    ) -> Result<Self> {
        let policy = match &config.policy_path {
            Some(path) => QuotaPolicy::from_file(path)?,
            None => QuotaPolicy::builtin(),
        };

        let (store, audit, backend): (Arc<dyn UsageStore>, Arc<dyn UsageAuditLog>, Backend) =
            match &config.redis_url {
                Some(url) => {
                    let store = RedisUsageStore::new(url).await?.with_prefix(&config.key_prefix);
                    let audit = RedisAuditLog::new(url).await?.with_prefix(&config.key_prefix);
                    (
                        Arc::new(store),
                        Arc::new(TracingAuditLog::new(audit)),
                        Backend::Redis,
                    )
                }
                None => (
                    Arc::new(InMemoryUsageStore::new()),
                    Arc::new(TracingAuditLog::new(InMemoryAuditLog::new())),
                    Backend::Memory,
                ),
            };

        let meter = UsageMeter::new(Arc::new(policy), store, resolver, audit)?
            .with_options(config.meter_options());

        info!(backend = backend.as_str(), "QuotaGuard meter ready");
        Ok(Self {
            meter: Arc::new(meter),
            backend,
        })
    }

    /// In-memory meter with the built-in policy
    pub fn in_memory(resolver: Arc<dyn SubscriptionResolver>) -> Result<Self> {
        let meter = UsageMeter::new(
            Arc::new(QuotaPolicy::builtin()),
            Arc::new(InMemoryUsageStore::new()),
            resolver,
            Arc::new(InMemoryAuditLog::new()),
        )?;
        Ok(Self {
            meter: Arc::new(meter),
            backend: Backend::Memory,
        })
    }

    pub fn meter(&self) -> &Arc<UsageMeter> {
        &self.meter
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotaguard_common::{Feature, SubscriptionSnapshot, TenantId, Tier};

    #[tokio::test]
    async fn test_from_config_defaults_to_memory() {
        let resolver = StaticSubscriptionResolver::new()
            .with_fallback(SubscriptionSnapshot::active(Tier::Creator));
        let guard = QuotaGuard::from_config(&MeterConfig::default(), Arc::new(resolver))
            .await
            .unwrap();
        assert_eq!(guard.backend(), Backend::Memory);

        let tenant = TenantId::new("acme").unwrap();
        let result = guard.meter().consume(&tenant, Feature::AiCredits, 1).await.unwrap();
        assert!(result.success);
        assert_eq!(guard.meter().history(&tenant, None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_policy_file_is_config_error() {
        let config = MeterConfig {
            policy_path: Some("/nonexistent/quota-policy.json".into()),
            ..MeterConfig::default()
        };
        let resolver = Arc::new(StaticSubscriptionResolver::new());
        assert!(matches!(
            QuotaGuard::from_config(&config, resolver).await,
            Err(quotaguard_common::QuotaError::Config(_))
        ));
    }
}
