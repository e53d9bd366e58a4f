//! Usage record store
//!
//! Persistence contract for the one-document-per-tenant usage record.
//! Adapters must apply every mutation atomically per tenant:
//! - increments use the backend's native atomic add, never read-modify-write
//!   in application code
//! - the bounded increment checks the ceiling and the period guard in the same
//!   atomic step as the add
//! - a reset is guarded by the period it expects to close, so it happens
//!   wholly before or wholly after any concurrent increment

mod memory;
mod redis_store;

pub use memory::InMemoryUsageStore;
pub use redis_store::RedisUsageStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quotaguard_common::{BillingPeriod, Counter, Limit, StoreError, TenantId, UsageRecord};

/// Result of a bounded increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// Counter was incremented to `total`
    Applied { total: u64 },
    /// Adding the amount would cross the ceiling; nothing changed
    LimitExceeded { used: u64 },
    /// The record is no longer in the expected period; nothing changed
    PeriodStale,
}

/// Result of a guarded reset
#[derive(Debug, Clone, PartialEq)]
pub enum ResetOutcome {
    /// This call closed the period; `cleared` holds the zeroed values
    Applied {
        record: UsageRecord,
        cleared: Vec<(Counter, u64)>,
    },
    /// Another caller already moved the record past the expected period
    AlreadyReset { record: UsageRecord },
}

/// Trait for usage record storage backends
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Load a tenant's record
    async fn get(&self, tenant: &TenantId) -> Result<Option<UsageRecord>, StoreError>;

    /// Create a zeroed record unless one already exists, returning the stored record
    async fn create_if_absent(
        &self,
        tenant: &TenantId,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, StoreError>;

    /// Unconditionally add `amount` to a counter
    async fn atomic_increment(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Add `amount` only if the total stays within `limit`
    ///
    /// With `expected_period_start` set, the add is also refused when the record
    /// has moved to another period or its period has elapsed at `now`.
    async fn increment_within_limit(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        limit: Limit,
        expected_period_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError>;

    /// Subtract `amount` from a counter, saturating at zero
    async fn atomic_decrement(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Zero resettable counters and move to `next`, if the record still ends at `expected_end`
    async fn reset_resettable_counters(
        &self,
        tenant: &TenantId,
        expected_end: DateTime<Utc>,
        next: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<ResetOutcome, StoreError>;
}
