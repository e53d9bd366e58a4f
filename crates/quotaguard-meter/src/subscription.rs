//! Subscription tier resolution
//!
//! The billing provider is external; the meter consumes it through
//! [`SubscriptionResolver`] and reads it once per decision. [`StatusPolicy`]
//! decides which billing states keep their paid tier.

use async_trait::async_trait;
use dashmap::DashMap;
use quotaguard_common::{SubscriptionSnapshot, SubscriptionStatus, TenantId, Tier};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from the billing provider
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolverError {
    #[error("Billing provider unavailable: {0}")]
    Unavailable(String),

    #[error("No subscription known for tenant {0}")]
    UnknownTenant(String),
}

/// Source of a tenant's current `{tier, status}`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionResolver: Send + Sync {
    async fn resolve_tier(&self, tenant: &TenantId) -> Result<SubscriptionSnapshot, ResolverError>;
}

/// Which non-active billing states keep the paid tier's limits
///
/// Anything not granted here is evaluated as [`Tier::RESTRICTIVE`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPolicy {
    /// `past_due` keeps the paid tier during a payment grace period
    pub past_due_grace: bool,
    /// `trialing` is treated like `active`
    pub trialing_is_active: bool,
}

impl StatusPolicy {
    /// Tier quotas are evaluated against for this snapshot
    pub fn effective_tier(&self, snapshot: SubscriptionSnapshot) -> Tier {
        let keeps_tier = match snapshot.status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::Trialing => self.trialing_is_active,
            SubscriptionStatus::PastDue => self.past_due_grace,
            SubscriptionStatus::Canceled
            | SubscriptionStatus::Unpaid
            | SubscriptionStatus::Incomplete => false,
        };

        if keeps_tier {
            snapshot.tier
        } else {
            debug!(tier = %snapshot.tier, status = %snapshot.status, "Subscription not in good standing");
            Tier::RESTRICTIVE
        }
    }
}

/// Fixed tenant -> subscription table
///
/// Used by the service binary and tests; production callers plug their billing
/// provider in through [`SubscriptionResolver`].
#[derive(Debug, Default)]
pub struct StaticSubscriptionResolver {
    subscriptions: DashMap<TenantId, SubscriptionSnapshot>,
    fallback: Option<SubscriptionSnapshot>,
}

impl StaticSubscriptionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot returned for tenants without an entry
    pub fn with_fallback(mut self, snapshot: SubscriptionSnapshot) -> Self {
        self.fallback = Some(snapshot);
        self
    }

    pub fn set(&self, tenant: TenantId, snapshot: SubscriptionSnapshot) {
        self.subscriptions.insert(tenant, snapshot);
    }

    /// Parse `tenant=tier:status` pairs separated by commas
    ///
    /// The status part is optional and defaults to `active`.
    pub fn parse_assignments(spec: &str) -> Result<Self, String> {
        let resolver = Self::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (tenant, plan) = entry
                .split_once('=')
                .ok_or_else(|| format!("expected tenant=tier[:status], got {}", entry))?;
            let (tier, status) = match plan.split_once(':') {
                Some((tier, status)) => (tier, status.parse::<SubscriptionStatus>()?),
                None => (plan, SubscriptionStatus::Active),
            };
            let tier = tier.parse::<Tier>().map_err(|e| e.to_string())?;
            let tenant = TenantId::new(tenant.trim()).map_err(|e| e.to_string())?;
            resolver.set(tenant, SubscriptionSnapshot::new(tier, status));
        }
        Ok(resolver)
    }
}

#[async_trait]
impl SubscriptionResolver for StaticSubscriptionResolver {
    async fn resolve_tier(&self, tenant: &TenantId) -> Result<SubscriptionSnapshot, ResolverError> {
        self.subscriptions
            .get(tenant)
            .map(|s| *s)
            .or(self.fallback)
            .ok_or_else(|| ResolverError::UnknownTenant(tenant.to_string()))
    }
}
