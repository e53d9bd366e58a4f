//! In-memory usage store
//!
//! Uses DashMap; every mutation runs under the tenant's shard write lock,
//! which makes check-and-add and guarded resets atomic per tenant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quotaguard_common::{BillingPeriod, Counter, Limit, StoreError, TenantId, UsageRecord};
use tracing::{debug, info};

use super::{IncrementOutcome, ResetOutcome, UsageStore};

/// DashMap-backed store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryUsageStore {
    records: DashMap<TenantId, UsageRecord>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Insert or replace a record wholesale, for seeding fixtures
    pub fn seed(&self, record: UsageRecord) {
        self.records.insert(record.tenant_id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn overflow(tenant: &TenantId, counter: Counter) -> StoreError {
    StoreError::Corrupt {
        tenant: tenant.to_string(),
        reason: format!("{} overflowed", counter),
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn get(&self, tenant: &TenantId) -> Result<Option<UsageRecord>, StoreError> {
        Ok(self.records.get(tenant).map(|r| r.clone()))
    }

    async fn create_if_absent(
        &self,
        tenant: &TenantId,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, StoreError> {
        match self.records.entry(tenant.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let record = UsageRecord::new(tenant.clone(), period, now);
                entry.insert(record.clone());
                info!(tenant = %tenant, "Created usage record");
                Ok(record)
            }
        }
    }

    async fn atomic_increment(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut record = self
            .records
            .get_mut(tenant)
            .ok_or_else(|| StoreError::NotFound(tenant.to_string()))?;
        record
            .add(counter, amount, now)
            .ok_or_else(|| overflow(tenant, counter))
    }

    async fn increment_within_limit(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        limit: Limit,
        expected_period_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError> {
        let mut record = self
            .records
            .get_mut(tenant)
            .ok_or_else(|| StoreError::NotFound(tenant.to_string()))?;

        if let Some(expected) = expected_period_start {
            if record.current_period_start != expected || record.period().has_elapsed(now) {
                debug!(tenant = %tenant, %counter, "Period moved under increment");
                return Ok(IncrementOutcome::PeriodStale);
            }
        }

        let used = record.used(counter);
        if !limit.admits(used, amount) {
            return Ok(IncrementOutcome::LimitExceeded { used });
        }

        let total = record
            .add(counter, amount, now)
            .ok_or_else(|| overflow(tenant, counter))?;
        Ok(IncrementOutcome::Applied { total })
    }

    async fn atomic_decrement(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut record = self
            .records
            .get_mut(tenant)
            .ok_or_else(|| StoreError::NotFound(tenant.to_string()))?;
        Ok(record.subtract(counter, amount, now))
    }

    async fn reset_resettable_counters(
        &self,
        tenant: &TenantId,
        expected_end: DateTime<Utc>,
        next: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<ResetOutcome, StoreError> {
        let mut record = self
            .records
            .get_mut(tenant)
            .ok_or_else(|| StoreError::NotFound(tenant.to_string()))?;

        if record.current_period_end != expected_end {
            return Ok(ResetOutcome::AlreadyReset {
                record: record.clone(),
            });
        }

        let cleared = record.reset_resettable(next, now);
        Ok(ResetOutcome::Applied {
            record: record.clone(),
            cleared,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn tenant() -> TenantId {
        TenantId::new("tenant-a").unwrap()
    }

    fn october() -> BillingPeriod {
        BillingPeriod::new(
            Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap(),
        )
    }

    fn mid_october() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_create_if_absent_does_not_overwrite() {
        let store = InMemoryUsageStore::new();
        let now = mid_october();

        store.create_if_absent(&tenant(), october(), now).await.unwrap();
        store
            .atomic_increment(&tenant(), Counter::AiCredits, 7, now)
            .await
            .unwrap();

        let again = store.create_if_absent(&tenant(), october(), now).await.unwrap();
        assert_eq!(again.ai_credits, 7);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_increment_missing_record() {
        let store = InMemoryUsageStore::new();
        let err = store
            .atomic_increment(&tenant(), Counter::ApiCalls, 1, mid_october())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_increment_within_limit() {
        let store = InMemoryUsageStore::new();
        let now = mid_october();
        store.create_if_absent(&tenant(), october(), now).await.unwrap();
        let guard = Some(october().start);

        let outcome = store
            .increment_within_limit(&tenant(), Counter::AiCredits, 295, Limit::Limited(300), guard, now)
            .await
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::Applied { total: 295 });

        let outcome = store
            .increment_within_limit(&tenant(), Counter::AiCredits, 10, Limit::Limited(300), guard, now)
            .await
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::LimitExceeded { used: 295 });

        let outcome = store
            .increment_within_limit(&tenant(), Counter::AiCredits, 10, Limit::Limited(300), Some(now), now)
            .await
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::PeriodStale);

        let after_end = october().end + Duration::seconds(1);
        let outcome = store
            .increment_within_limit(&tenant(), Counter::AiCredits, 1, Limit::Limited(300), guard, after_end)
            .await
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::PeriodStale);
    }

    #[tokio::test]
    async fn test_decrement_saturates() {
        let store = InMemoryUsageStore::new();
        let now = mid_october();
        store.create_if_absent(&tenant(), october(), now).await.unwrap();
        store
            .atomic_increment(&tenant(), Counter::ContextFiles, 2, now)
            .await
            .unwrap();

        let total = store
            .atomic_decrement(&tenant(), Counter::ContextFiles, 5, now)
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_reset_is_guarded() {
        let store = InMemoryUsageStore::new();
        let now = mid_october();
        store.create_if_absent(&tenant(), october(), now).await.unwrap();
        store
            .atomic_increment(&tenant(), Counter::AiEdits, 4, now)
            .await
            .unwrap();
        store
            .atomic_increment(&tenant(), Counter::StorageGb, 8, now)
            .await
            .unwrap();

        let november = BillingPeriod::new(
            october().end,
            Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap(),
        );
        let first = store
            .reset_resettable_counters(&tenant(), october().end, november, now)
            .await
            .unwrap();
        match first {
            ResetOutcome::Applied { record, cleared } => {
                assert_eq!(record.ai_edits, 0);
                assert_eq!(record.storage_used_gb, 8);
                assert!(cleared.contains(&(Counter::AiEdits, 4)));
            }
            other => panic!("expected applied reset, got {:?}", other),
        }

        let second = store
            .reset_resettable_counters(&tenant(), october().end, november, now)
            .await
            .unwrap();
        assert!(matches!(second, ResetOutcome::AlreadyReset { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bounded_increments_never_overshoot() {
        let store = Arc::new(InMemoryUsageStore::new());
        let now = mid_october();
        store.create_if_absent(&tenant(), october(), now).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .increment_within_limit(&tenant(), Counter::ApiCalls, 1, Limit::Limited(10), None, now)
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), IncrementOutcome::Applied { .. }) {
                applied += 1;
            }
        }

        assert_eq!(applied, 10);
        let record = store.get(&tenant()).await.unwrap().unwrap();
        assert_eq!(record.api_calls, 10);
    }
}
