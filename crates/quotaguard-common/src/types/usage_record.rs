//! UsageRecord - per-tenant usage document
//!
//! One record per tenant holds every counter plus the active billing window.
//! Key characteristics:
//! - Counters are unsigned, so the non-negative invariant holds by construction
//! - Resettable counters are zeroed on period rollover, cumulative ones never are
//! - Mutations go through the methods below; store adapters apply them inside
//!   their own atomic section

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feature::Counter;
use super::period::BillingPeriod;
use super::tenant::TenantId;

/// Persisted usage document for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// Owning tenant
    pub tenant_id: TenantId,

    // Resettable counters
    pub ai_credits: u64,
    pub ai_edits: u64,
    pub api_calls: u64,

    // Cumulative counters
    pub social_sets: u64,
    #[serde(rename = "storageUsedGB")]
    pub storage_used_gb: u64,
    pub context_files: u64,

    /// Start of the active billing window
    pub current_period_start: DateTime<Utc>,
    /// Exclusive end of the active billing window
    pub current_period_end: DateTime<Utc>,
    /// Advisory timestamp of the last mutation
    pub last_updated: DateTime<Utc>,
}

impl UsageRecord {
    /// Create a zeroed record for a tenant
    pub fn new(tenant_id: TenantId, period: BillingPeriod, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            ai_credits: 0,
            ai_edits: 0,
            api_calls: 0,
            social_sets: 0,
            storage_used_gb: 0,
            context_files: 0,
            current_period_start: period.start,
            current_period_end: period.end,
            last_updated: now,
        }
    }

    /// Current value of a counter
    pub fn used(&self, counter: Counter) -> u64 {
        match counter {
            Counter::AiCredits => self.ai_credits,
            Counter::AiEdits => self.ai_edits,
            Counter::SocialSets => self.social_sets,
            Counter::StorageGb => self.storage_used_gb,
            Counter::ContextFiles => self.context_files,
            Counter::ApiCalls => self.api_calls,
        }
    }

    /// Active billing window
    pub fn period(&self) -> BillingPeriod {
        BillingPeriod::new(self.current_period_start, self.current_period_end)
    }

    /// Add to a counter, returning the new total or `None` on overflow
    pub fn add(&mut self, counter: Counter, amount: u64, now: DateTime<Utc>) -> Option<u64> {
        let slot = self.counter_mut(counter);
        let total = slot.checked_add(amount)?;
        *slot = total;
        self.last_updated = now;
        Some(total)
    }

    /// Subtract from a counter, saturating at zero
    pub fn subtract(&mut self, counter: Counter, amount: u64, now: DateTime<Utc>) -> u64 {
        let slot = self.counter_mut(counter);
        *slot = slot.saturating_sub(amount);
        let total = *slot;
        self.last_updated = now;
        total
    }

    /// Zero resettable counters and move to `period`
    ///
    /// Returns the cleared values so the caller can audit them.
    pub fn reset_resettable(
        &mut self,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Vec<(Counter, u64)> {
        let cleared = Counter::RESETTABLE
            .into_iter()
            .map(|counter| {
                let slot = self.counter_mut(counter);
                let previous = *slot;
                *slot = 0;
                (counter, previous)
            })
            .collect();

        self.current_period_start = period.start;
        self.current_period_end = period.end;
        self.last_updated = now;
        cleared
    }

    fn counter_mut(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::AiCredits => &mut self.ai_credits,
            Counter::AiEdits => &mut self.ai_edits,
            Counter::SocialSets => &mut self.social_sets,
            Counter::StorageGb => &mut self.storage_used_gb,
            Counter::ContextFiles => &mut self.context_files,
            Counter::ApiCalls => &mut self.api_calls,
        }
    }
}

impl std::fmt::Display for UsageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UsageRecord(tenant={}, period={}..{})",
            self.tenant_id,
            self.current_period_start.format("%Y-%m-%d"),
            self.current_period_end.format("%Y-%m-%d")
        )
    }
}
