//! Usage meter
//!
//! Per call, strictly sequential and with no persisted intermediate state:
//!
//! ```text
//! RESOLVE_TIER -> LOAD_OR_CREATE_RECORD -> MAYBE_RESET -> CHECK_LIMIT -> ALLOW: INCREMENT + LOG
//!                                                                     -> DENY:  LOG ONLY
//! ```
//!
//! The limit check and the increment are one atomic store operation guarded by
//! the period the record was loaded in. When a rollover lands between the load
//! and the increment the store refuses the add and the call starts over from
//! the load, up to `max_conflict_retries` times.
//!
//! Every path that is not a clean allow ends in a denial: unknown tiers resolve
//! to the restrictive tier, unmapped features and infrastructure failures deny.

mod decision;
mod metrics;

pub use decision::{quota_message, ConsumeResult, Decision, DenialReason};
pub use metrics::MeterMetrics;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quotaguard_common::{
    Counter, Feature, PolicyError, QuotaError, Result, StoreError, TenantId, Tier, UsageRecord,
    DEFAULT_HISTORY_LIMIT, MAX_AMOUNT, MAX_HISTORY_LIMIT,
};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditAction, AuditDecision, AuditEntry, UsageAuditLog};
use crate::period::BillingPeriodManager;
use crate::policy::QuotaPolicy;
use crate::store::{IncrementOutcome, ResetOutcome, UsageStore};
use crate::subscription::{StatusPolicy, SubscriptionResolver};

/// Tunables for [`UsageMeter`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterOptions {
    /// Bound on every store and audit call
    pub store_timeout: Duration,
    /// Bound on the subscription lookup
    pub resolver_timeout: Duration,
    /// Extra attempts when a period rollover races the increment
    pub max_conflict_retries: u32,
    pub status_policy: StatusPolicy,
}

impl Default for MeterOptions {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(2000),
            resolver_timeout: Duration::from_millis(2000),
            max_conflict_retries: 3,
            status_policy: StatusPolicy::default(),
        }
    }
}

/// Quota decisions and counter mutations for all tenants
pub struct UsageMeter {
    policy: Arc<QuotaPolicy>,
    store: Arc<dyn UsageStore>,
    resolver: Arc<dyn SubscriptionResolver>,
    audit: Arc<dyn UsageAuditLog>,
    periods: BillingPeriodManager,
    metrics: Arc<MeterMetrics>,
    options: MeterOptions,
}

impl UsageMeter {
    pub fn new(
        policy: Arc<QuotaPolicy>,
        store: Arc<dyn UsageStore>,
        resolver: Arc<dyn SubscriptionResolver>,
        audit: Arc<dyn UsageAuditLog>,
    ) -> Result<Self> {
        let metrics = MeterMetrics::new()
            .map_err(|e| QuotaError::Internal(format!("Failed to create metrics: {}", e)))?;

        Ok(Self {
            policy,
            store,
            resolver,
            audit,
            periods: BillingPeriodManager::new(),
            metrics: Arc::new(metrics),
            options: MeterOptions::default(),
        })
    }

    pub fn with_options(mut self, options: MeterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn metrics(&self) -> &Arc<MeterMetrics> {
        &self.metrics
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// Read-only pre-flight check
    ///
    /// Never creates or rewrites a record. A record whose period has elapsed is
    /// evaluated as if the reset had already happened, and a tenant without a
    /// record is evaluated against zeros, so repeated calls return the same
    /// answer until something else changes the counters.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn can_use(&self, tenant: &TenantId, feature: Feature, amount: u64) -> Result<Decision> {
        ensure_amount(amount)?;
        let tier = self.resolve_tier(tenant).await?;
        let now = Utc::now();
        let record = self.project(tenant, now).await?;
        Ok(self.decide(tier, feature, &record, amount))
    }

    /// [`Self::can_use`] for a feature given by name; unknown names are not allowed
    pub async fn can_use_named(&self, tenant: &TenantId, feature: &str, amount: u64) -> Result<Decision> {
        match feature.parse::<Feature>() {
            Ok(feature) => self.can_use(tenant, feature, amount).await,
            Err(_) => {
                ensure_amount(amount)?;
                debug!(tenant = %tenant, feature, "Unmapped feature name");
                Ok(Decision::unmapped(0))
            }
        }
    }

    /// Check and spend `amount` units of `feature`
    ///
    /// `Err` is reserved for caller mistakes. Quota denials and infrastructure
    /// failures both come back as an unsuccessful [`ConsumeResult`]; use
    /// [`ConsumeResult::denial`] to tell an upgrade prompt from a retry.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn consume(&self, tenant: &TenantId, feature: Feature, amount: u64) -> Result<ConsumeResult> {
        ensure_amount(amount)?;
        let _timer = self.metrics.consume_duration_seconds.start_timer();
        let counter = feature.counter();

        let tier = match self.resolve_tier(tenant).await {
            Ok(tier) => tier,
            Err(e) => {
                warn!(tenant = %tenant, %feature, amount, error = %e, "Subscription resolution failed, denying");
                let result = ConsumeResult::denied(
                    DenialReason::SubscriptionUnavailable,
                    "We couldn't verify your subscription right now. Please try again.",
                );
                return Ok(self.deny(tenant, feature, amount, result, None).await);
            }
        };

        let limit = match self.policy.limit_for(tier, feature) {
            Ok(limit) => limit,
            Err(e) => {
                warn!(tenant = %tenant, %feature, %tier, error = %e, "Feature not mapped for tier, denying");
                let result = ConsumeResult::denied(
                    DenialReason::UnmappedFeature,
                    format!("{} is not available on the {} plan", feature, tier),
                );
                return Ok(self.deny(tenant, feature, amount, result, None).await);
            }
        };

        let attempts = self.options.max_conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            let now = Utc::now();
            let record = match self.load_current(tenant, now).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(tenant = %tenant, %feature, amount, error = %e, "Usage store unavailable, denying");
                    let result = ConsumeResult::denied(
                        DenialReason::StoreUnavailable,
                        "Usage tracking is temporarily unavailable. Please try again.",
                    );
                    return Ok(self.deny(tenant, feature, amount, result, None).await);
                }
            };

            let increment = self.store.increment_within_limit(
                tenant,
                counter,
                amount,
                limit,
                Some(record.current_period_start),
                now,
            );

            let outcome = match timeout(self.options.store_timeout, increment).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(tenant = %tenant, %feature, amount, error = %e, "Increment failed, denying");
                    let result = ConsumeResult::denied(
                        DenialReason::StoreUnavailable,
                        "Usage tracking is temporarily unavailable. Please try again.",
                    );
                    return Ok(self.deny(tenant, feature, amount, result, None).await);
                }
                Err(_) => {
                    warn!(tenant = %tenant, %feature, amount, "Increment timed out, outcome unknown");
                    let result = ConsumeResult::denied(
                        DenialReason::OutcomeUnknown,
                        "The request timed out. Check your usage before trying again.",
                    );
                    return Ok(self.deny(tenant, feature, amount, result, None).await);
                }
            };

            match outcome {
                IncrementOutcome::Applied { total } => {
                    let usage = Decision::from_parts(
                        total,
                        limit,
                        true,
                        counter,
                        record.current_period_end,
                    );
                    self.metrics.decisions_allowed.inc();
                    self.audit_best_effort(
                        AuditEntry::new(tenant.clone(), feature, AuditAction::Consume, amount, AuditDecision::Allowed)
                            .with_total(total)
                            .with_timestamp(now)
                            .with_detail("tier", tier),
                    )
                    .await;
                    return Ok(ConsumeResult::allowed(counter, amount, usage));
                }
                IncrementOutcome::LimitExceeded { used } => {
                    let usage = Decision::from_parts(
                        used,
                        limit,
                        false,
                        counter,
                        record.current_period_end,
                    );
                    debug!(tenant = %tenant, %feature, amount, used, %limit, "Quota exceeded");
                    let result = ConsumeResult::exceeded(counter, usage);
                    return Ok(self.deny(tenant, feature, amount, result, Some(tier)).await);
                }
                IncrementOutcome::PeriodStale => {
                    debug!(tenant = %tenant, %feature, attempt, "Period rolled over during consume, retrying");
                }
            }
        }

        warn!(tenant = %tenant, %feature, amount, attempts, "Conflict retries exhausted, denying");
        let result = ConsumeResult::denied(
            DenialReason::ConcurrencyConflict,
            "Your usage changed while we were processing the request. Please try again.",
        );
        Ok(self.deny(tenant, feature, amount, result, None).await)
    }

    /// [`Self::consume`] for a feature given by name; unknown names are denied
    pub async fn consume_named(&self, tenant: &TenantId, feature: &str, amount: u64) -> Result<ConsumeResult> {
        match feature.parse::<Feature>() {
            Ok(feature) => self.consume(tenant, feature, amount).await,
            Err(_) => {
                ensure_amount(amount)?;
                warn!(tenant = %tenant, feature, "Unmapped feature name, denying");
                self.metrics.denied(DenialReason::UnmappedFeature);
                Ok(ConsumeResult::denied(
                    DenialReason::UnmappedFeature,
                    format!("Unknown feature {}", feature),
                ))
            }
        }
    }

    /// Record usage that has already happened, without a ceiling check
    ///
    /// For measurements taken after the fact, such as storage after an upload
    /// completes. Returns the new counter total.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn record(&self, tenant: &TenantId, feature: Feature, amount: u64) -> Result<u64> {
        ensure_amount(amount)?;
        let now = Utc::now();
        self.load_current(tenant, now).await?;

        let total = self
            .bounded(
                "atomic_increment",
                self.store.atomic_increment(tenant, feature.counter(), amount, now),
            )
            .await?;

        self.audit_best_effort(
            AuditEntry::new(tenant.clone(), feature, AuditAction::Record, amount, AuditDecision::Applied)
                .with_total(total)
                .with_timestamp(now),
        )
        .await;
        Ok(total)
    }

    /// Give back units of a cumulative resource, saturating at zero
    ///
    /// Resettable counters only go down at period rollover.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn release(&self, tenant: &TenantId, feature: Feature, amount: u64) -> Result<u64> {
        ensure_amount(amount)?;
        let counter = feature.counter();
        if counter.is_resettable() {
            return Err(PolicyError::NotCumulative(counter).into());
        }

        let now = Utc::now();
        self.load_current(tenant, now).await?;

        let total = self
            .bounded(
                "atomic_decrement",
                self.store.atomic_decrement(tenant, counter, amount, now),
            )
            .await?;

        self.audit_best_effort(
            AuditEntry::new(tenant.clone(), feature, AuditAction::Release, amount, AuditDecision::Applied)
                .with_total(total)
                .with_timestamp(now),
        )
        .await;
        Ok(total)
    }

    /// Audit entries for a tenant, newest first
    ///
    /// `limit` defaults to 50 and is capped at 1000.
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn history(
        &self,
        tenant: &TenantId,
        feature: Option<Feature>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }

        match timeout(self.options.store_timeout, self.audit.history(tenant, feature, limit)).await {
            Ok(entries) => Ok(entries?),
            Err(_) => Err(QuotaError::Timeout("audit history".to_string())),
        }
    }

    /// Usage of every counter for the tenant's current tier
    ///
    /// Read-only like [`Self::can_use`]; `allowed` answers "may one more unit be used".
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    pub async fn all_usage(&self, tenant: &TenantId) -> Result<BTreeMap<Feature, Decision>> {
        let tier = self.resolve_tier(tenant).await?;
        let record = self.project(tenant, Utc::now()).await?;

        Ok(Counter::ALL
            .into_iter()
            .map(|counter| {
                let feature = Feature::from(counter);
                (feature, self.decide(tier, feature, &record, 1))
            })
            .collect())
    }

    async fn resolve_tier(&self, tenant: &TenantId) -> Result<Tier> {
        match timeout(self.options.resolver_timeout, self.resolver.resolve_tier(tenant)).await {
            Ok(Ok(snapshot)) => Ok(self.options.status_policy.effective_tier(snapshot)),
            Ok(Err(e)) => Err(QuotaError::Subscription(e.to_string())),
            Err(_) => Err(QuotaError::Subscription(format!(
                "billing provider did not answer within {:?}",
                self.options.resolver_timeout
            ))),
        }
    }

    fn decide(&self, tier: Tier, feature: Feature, record: &UsageRecord, amount: u64) -> Decision {
        let counter = feature.counter();
        match self.policy.limit_for(tier, feature) {
            Ok(limit) => Decision::evaluate(record, counter, limit, amount),
            Err(e) => {
                debug!(%feature, %tier, error = %e, "No ceiling for feature");
                Decision::unmapped(record.used(counter))
            }
        }
    }

    /// The tenant's record as the next consume would see it, without writing
    async fn project(&self, tenant: &TenantId, now: DateTime<Utc>) -> Result<UsageRecord> {
        let stored = self.bounded("get", self.store.get(tenant)).await?;
        Ok(match stored {
            None => UsageRecord::new(tenant.clone(), self.periods.initial_period(now), now),
            Some(mut record) if self.periods.needs_reset(&record, now) => {
                record.reset_resettable(self.periods.period_containing(now), now);
                record
            }
            Some(record) => record,
        })
    }

    /// Load or lazily create the record, rolling its period over if it has elapsed
    async fn load_current(&self, tenant: &TenantId, now: DateTime<Utc>) -> Result<UsageRecord> {
        let record = match self.bounded("get", self.store.get(tenant)).await? {
            Some(record) => record,
            None => {
                let period = self.periods.initial_period(now);
                self.bounded(
                    "create_if_absent",
                    self.store.create_if_absent(tenant, period, now),
                )
                .await?
            }
        };

        if !self.periods.needs_reset(&record, now) {
            return Ok(record);
        }

        let next = self.periods.period_containing(now);
        let outcome = self
            .bounded(
                "reset_resettable_counters",
                self.store
                    .reset_resettable_counters(tenant, record.current_period_end, next, now),
            )
            .await?;

        match outcome {
            ResetOutcome::Applied { record, cleared } => {
                self.metrics.resets.inc();
                info!(
                    tenant = %tenant,
                    period_start = %record.current_period_start,
                    period_end = %record.current_period_end,
                    "Billing period reset"
                );
                for (counter, previous) in cleared {
                    self.audit_best_effort(
                        AuditEntry::new(
                            tenant.clone(),
                            Feature::from(counter),
                            AuditAction::Reset,
                            previous,
                            AuditDecision::Applied,
                        )
                        .with_total(0)
                        .with_timestamp(now)
                        .with_detail("cleared", previous)
                        .with_detail("period_end", record.current_period_end),
                    )
                    .await;
                }
                Ok(record)
            }
            ResetOutcome::AlreadyReset { record } => Ok(record),
        }
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match timeout(self.options.store_timeout, fut).await {
            Ok(result) => result.map_err(QuotaError::from),
            Err(_) => Err(QuotaError::Timeout(format!(
                "store {} exceeded {:?}",
                operation, self.options.store_timeout
            ))),
        }
    }

    async fn deny(
        &self,
        tenant: &TenantId,
        feature: Feature,
        amount: u64,
        result: ConsumeResult,
        tier: Option<Tier>,
    ) -> ConsumeResult {
        let reason = result.denial.unwrap_or(DenialReason::QuotaExceeded);
        self.metrics.denied(reason);

        let mut entry = AuditEntry::new(
            tenant.clone(),
            feature,
            AuditAction::Consume,
            amount,
            AuditDecision::Denied,
        )
        .with_detail("reason", reason);
        if let Some(usage) = &result.usage {
            entry = entry.with_total(usage.used);
        }
        if let Some(tier) = tier {
            entry = entry.with_detail("tier", tier);
        }
        self.audit_best_effort(entry).await;
        result
    }

    /// Append to the audit log; failures are counted and dropped
    async fn audit_best_effort(&self, entry: AuditEntry) {
        let id = entry.id;
        match timeout(self.options.store_timeout, self.audit.record(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics.audit_failures.inc();
                debug!(%id, error = %e, "Audit write failed");
            }
            Err(_) => {
                self.metrics.audit_failures.inc();
                debug!(%id, "Audit write timed out");
            }
        }
    }
}

fn ensure_amount(amount: u64) -> Result<()> {
    if amount == 0 || amount > MAX_AMOUNT {
        return Err(QuotaError::InvalidAmount);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, InMemoryAuditLog};
    use crate::store::InMemoryUsageStore;
    use crate::subscription::{MockSubscriptionResolver, ResolverError};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use quotaguard_common::{BillingPeriod, Limit, SubscriptionSnapshot, SubscriptionStatus};

    fn tenant() -> TenantId {
        TenantId::new("tenant-a").unwrap()
    }

    fn resolver_for(snapshot: SubscriptionSnapshot) -> Arc<dyn SubscriptionResolver> {
        let mut resolver = MockSubscriptionResolver::new();
        resolver
            .expect_resolve_tier()
            .returning(move |_| Ok(snapshot));
        Arc::new(resolver)
    }

    struct Harness {
        meter: UsageMeter,
        store: Arc<InMemoryUsageStore>,
        audit: Arc<InMemoryAuditLog>,
    }

    fn harness(tier: Tier) -> Harness {
        harness_with(SubscriptionSnapshot::active(tier))
    }

    fn harness_with(snapshot: SubscriptionSnapshot) -> Harness {
        let store = Arc::new(InMemoryUsageStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let meter = UsageMeter::new(
            Arc::new(QuotaPolicy::builtin()),
            store.clone(),
            resolver_for(snapshot),
            audit.clone(),
        )
        .unwrap();
        Harness { meter, store, audit }
    }

    fn seed(store: &InMemoryUsageStore, period: BillingPeriod, f: impl FnOnce(&mut UsageRecord)) {
        let mut record = UsageRecord::new(tenant(), period, period.start);
        f(&mut record);
        store.seed(record);
    }

    fn current_period() -> BillingPeriod {
        BillingPeriodManager::new().period_containing(Utc::now())
    }

    fn elapsed_period() -> BillingPeriod {
        let end = Utc::now() - ChronoDuration::days(1);
        BillingPeriod::new(end - ChronoDuration::days(30), end)
    }

    #[tokio::test]
    async fn test_out_of_range_amount_is_caller_error() {
        let h = harness(Tier::Creator);
        assert!(matches!(
            h.meter.consume(&tenant(), Feature::AiCredits, 0).await,
            Err(QuotaError::InvalidAmount)
        ));
        assert!(matches!(
            h.meter.can_use(&tenant(), Feature::AiCredits, 0).await,
            Err(QuotaError::InvalidAmount)
        ));
        assert!(matches!(
            h.meter.consume(&tenant(), Feature::AiCredits, MAX_AMOUNT + 1).await,
            Err(QuotaError::InvalidAmount)
        ));
        assert!(matches!(
            h.meter.record(&tenant(), Feature::StorageGb, u64::MAX).await,
            Err(QuotaError::InvalidAmount)
        ));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_consume_up_to_limit() {
        let h = harness(Tier::Creator);
        seed(&h.store, current_period(), |r| r.ai_credits = 295);

        let denied = h.meter.consume(&tenant(), Feature::AiCredits, 10).await.unwrap();
        assert!(!denied.success);
        assert!(denied.is_quota_denial());
        let usage = denied.usage.unwrap();
        assert_eq!(usage.used, 295);
        assert_eq!(usage.limit, Limit::Limited(300));

        let allowed = h.meter.consume(&tenant(), Feature::AiCredits, 5).await.unwrap();
        assert!(allowed.success);
        assert_eq!(allowed.usage.unwrap().used, 300);

        let over = h.meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert!(!over.success);
        assert!(over.message.starts_with("You've used 300/300 AI credits, resets"));
    }

    #[tokio::test]
    async fn test_composite_feature_spends_base_counter() {
        let h = harness(Tier::Spark);
        let result = h.meter.consume(&tenant(), Feature::PostCreation, 3).await.unwrap();
        assert!(result.success);

        let record = h.store.get(&tenant()).await.unwrap().unwrap();
        assert_eq!(record.api_calls, 3);

        let history = h.meter.history(&tenant(), Some(Feature::ApiCalls), None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].feature, Feature::PostCreation);
    }

    #[tokio::test]
    async fn test_enterprise_is_unlimited() {
        let h = harness(Tier::Enterprise);
        let result = h
            .meter
            .consume(&tenant(), Feature::AiCredits, 1_000_000)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.usage.unwrap().percentage, 0.0);
    }

    #[tokio::test]
    async fn test_lazy_record_creation() {
        let h = harness(Tier::Growth);
        assert!(h.store.is_empty());

        h.meter.consume(&tenant(), Feature::AiEdits, 1).await.unwrap();

        let record = h.store.get(&tenant()).await.unwrap().unwrap();
        assert_eq!(record.ai_edits, 1);
        assert!(record.current_period_end > record.current_period_start);
    }

    #[tokio::test]
    async fn test_rollover_keeps_cumulative_counters() {
        let h = harness(Tier::Creator);
        seed(&h.store, elapsed_period(), |r| {
            r.ai_credits = 300;
            r.storage_used_gb = 8;
        });

        let result = h.meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert!(result.success);
        assert_eq!(result.usage.unwrap().used, 1);

        let record = h.store.get(&tenant()).await.unwrap().unwrap();
        assert_eq!(record.storage_used_gb, 8);
        assert!(record.current_period_end > Utc::now());
        assert_eq!(h.meter.metrics().resets.get(), 1);

        let resets: Vec<_> = h
            .audit
            .history(&tenant(), None, 50)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == AuditAction::Reset)
            .collect();
        assert_eq!(resets.len(), Counter::RESETTABLE.len());
        assert!(resets
            .iter()
            .any(|e| e.counter == Counter::AiCredits && e.amount_requested == 300));
    }

    #[tokio::test]
    async fn test_can_use_is_pure() {
        let h = harness(Tier::Creator);
        seed(&h.store, elapsed_period(), |r| {
            r.ai_credits = 300;
            r.storage_used_gb = 8;
        });
        let before = h.store.get(&tenant()).await.unwrap();

        let first = h.meter.can_use(&tenant(), Feature::AiCredits, 1).await.unwrap();
        let second = h.meter.can_use(&tenant(), Feature::AiCredits, 1).await.unwrap();

        assert_eq!(first, second);
        assert!(first.allowed);
        assert_eq!(first.used, 0);
        assert_eq!(h.store.get(&tenant()).await.unwrap(), before);
        assert_eq!(h.audit.count(&tenant()), 0);
    }

    #[tokio::test]
    async fn test_can_use_without_record() {
        let h = harness(Tier::Spark);
        let decision = h.meter.can_use(&tenant(), Feature::SocialSets, 2).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.limit, Limit::Limited(1));
        assert_eq!(decision.reset_date, None);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_resolver_failure_fails_closed() {
        let mut resolver = MockSubscriptionResolver::new();
        resolver
            .expect_resolve_tier()
            .returning(|_| Err(ResolverError::Unavailable("connection refused".to_string())));
        let store = Arc::new(InMemoryUsageStore::new());
        let meter = UsageMeter::new(
            Arc::new(QuotaPolicy::builtin()),
            store.clone(),
            Arc::new(resolver),
            Arc::new(InMemoryAuditLog::new()),
        )
        .unwrap();

        let result = meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.denial, Some(DenialReason::SubscriptionUnavailable));
        assert!(result.retryable);
        assert!(store.is_empty());

        assert!(matches!(
            meter.can_use(&tenant(), Feature::AiCredits, 1).await,
            Err(QuotaError::Subscription(_))
        ));
    }

    struct SlowResolver;

    #[async_trait]
    impl SubscriptionResolver for SlowResolver {
        async fn resolve_tier(
            &self,
            _tenant: &TenantId,
        ) -> std::result::Result<SubscriptionSnapshot, ResolverError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(SubscriptionSnapshot::active(Tier::Enterprise))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_timeout_fails_closed() {
        let store = Arc::new(InMemoryUsageStore::new());
        let meter = UsageMeter::new(
            Arc::new(QuotaPolicy::builtin()),
            store.clone(),
            Arc::new(SlowResolver),
            Arc::new(InMemoryAuditLog::new()),
        )
        .unwrap();

        let result = meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.denial, Some(DenialReason::SubscriptionUnavailable));
        assert!(result.retryable);
        assert!(store.is_empty());

        assert!(matches!(
            meter.can_use(&tenant(), Feature::AiCredits, 1).await,
            Err(QuotaError::Subscription(_))
        ));
    }

    #[tokio::test]
    async fn test_past_due_falls_back_unless_graced() {
        let snapshot = SubscriptionSnapshot::new(Tier::Pro, SubscriptionStatus::PastDue);

        let strict = harness_with(snapshot);
        let decision = strict.meter.can_use(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert_eq!(decision.limit, Limit::Limited(50));

        let graced = harness_with(snapshot);
        let meter = graced.meter.with_options(MeterOptions {
            status_policy: StatusPolicy {
                past_due_grace: true,
                trialing_is_active: false,
            },
            ..MeterOptions::default()
        });
        let decision = meter.can_use(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert_eq!(decision.limit, Limit::Limited(3000));
    }

    #[tokio::test]
    async fn test_unmapped_feature_denied() {
        let policy = QuotaPolicy::from_json(r#"{"spark": {"ai_credits": 50}}"#).unwrap();
        let store = Arc::new(InMemoryUsageStore::new());
        let meter = UsageMeter::new(
            Arc::new(policy),
            store.clone(),
            resolver_for(SubscriptionSnapshot::active(Tier::Spark)),
            Arc::new(InMemoryAuditLog::new()),
        )
        .unwrap();

        let result = meter.consume(&tenant(), Feature::ApiCalls, 1).await.unwrap();
        assert_eq!(result.denial, Some(DenialReason::UnmappedFeature));
        assert!(store.is_empty());

        let decision = meter.can_use(&tenant(), Feature::ApiCalls, 1).await.unwrap();
        assert!(!decision.allowed);

        let named = meter.consume_named(&tenant(), "teleportation", 1).await.unwrap();
        assert_eq!(named.denial, Some(DenialReason::UnmappedFeature));
        let named = meter.can_use_named(&tenant(), "teleportation", 1).await.unwrap();
        assert!(!named.allowed);
    }

    #[tokio::test]
    async fn test_record_and_release() {
        let h = harness(Tier::Spark);

        assert_eq!(h.meter.record(&tenant(), Feature::StorageGb, 3).await.unwrap(), 3);
        // Post-hoc usage is not capped
        assert_eq!(h.meter.record(&tenant(), Feature::StorageGb, 3).await.unwrap(), 6);
        assert_eq!(h.meter.release(&tenant(), Feature::StorageGb, 10).await.unwrap(), 0);

        assert!(matches!(
            h.meter.release(&tenant(), Feature::AiCredits, 1).await,
            Err(QuotaError::Policy(PolicyError::NotCumulative(Counter::AiCredits)))
        ));

        let history = h.meter.history(&tenant(), None, None).await.unwrap();
        let actions: Vec<_> = history.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Release, AuditAction::Record, AuditAction::Record]
        );
    }

    #[tokio::test]
    async fn test_all_usage_lists_every_counter() {
        let h = harness(Tier::Creator);
        seed(&h.store, current_period(), |r| r.context_files = 10);

        let usage = h.meter.all_usage(&tenant()).await.unwrap();
        assert_eq!(usage.len(), Counter::ALL.len());
        assert_eq!(usage.keys().next(), Some(&Feature::AiCredits));

        let files = &usage[&Feature::ContextFiles];
        assert_eq!(files.used, 10);
        assert!(!files.allowed);
        assert_eq!(files.percentage, 100.0);
    }

    #[tokio::test]
    async fn test_history_limit_clamped() {
        let h = harness(Tier::Enterprise);
        for _ in 0..3 {
            h.meter.consume(&tenant(), Feature::ApiCalls, 1).await.unwrap();
        }
        assert_eq!(h.meter.history(&tenant(), None, Some(2)).await.unwrap().len(), 2);
        assert!(h.meter.history(&tenant(), None, Some(0)).await.unwrap().is_empty());
        assert_eq!(h.meter.history(&tenant(), None, Some(5000)).await.unwrap().len(), 3);
    }

    struct FailingAuditLog;

    #[async_trait]
    impl UsageAuditLog for FailingAuditLog {
        async fn record(&self, _entry: AuditEntry) -> std::result::Result<(), AuditError> {
            Err(AuditError::Unavailable("disk full".to_string()))
        }

        async fn history(
            &self,
            _tenant: &TenantId,
            _feature: Option<Feature>,
            _limit: usize,
        ) -> std::result::Result<Vec<AuditEntry>, AuditError> {
            Err(AuditError::Unavailable("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_consume() {
        let store = Arc::new(InMemoryUsageStore::new());
        let meter = UsageMeter::new(
            Arc::new(QuotaPolicy::builtin()),
            store.clone(),
            resolver_for(SubscriptionSnapshot::active(Tier::Creator)),
            Arc::new(FailingAuditLog),
        )
        .unwrap();

        let result = meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert!(result.success);
        assert_eq!(store.get(&tenant()).await.unwrap().unwrap().ai_credits, 1);
        assert_eq!(meter.metrics().audit_failures.get(), 1);
        assert!(meter.history(&tenant(), None, None).await.is_err());
    }

    /// Delegates to an in-memory store with configurable faults
    struct FaultyStore {
        inner: InMemoryUsageStore,
        fail_reads: bool,
        always_stale: bool,
        hang_increment: bool,
    }

    impl FaultyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryUsageStore::new(),
                fail_reads: false,
                always_stale: false,
                hang_increment: false,
            }
        }
    }

    #[async_trait]
    impl UsageStore for FaultyStore {
        async fn get(&self, tenant: &TenantId) -> std::result::Result<Option<UsageRecord>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.get(tenant).await
        }

        async fn create_if_absent(
            &self,
            tenant: &TenantId,
            period: BillingPeriod,
            now: DateTime<Utc>,
        ) -> std::result::Result<UsageRecord, StoreError> {
            self.inner.create_if_absent(tenant, period, now).await
        }

        async fn atomic_increment(
            &self,
            tenant: &TenantId,
            counter: Counter,
            amount: u64,
            now: DateTime<Utc>,
        ) -> std::result::Result<u64, StoreError> {
            self.inner.atomic_increment(tenant, counter, amount, now).await
        }

        async fn increment_within_limit(
            &self,
            tenant: &TenantId,
            counter: Counter,
            amount: u64,
            limit: Limit,
            expected_period_start: Option<DateTime<Utc>>,
            now: DateTime<Utc>,
        ) -> std::result::Result<IncrementOutcome, StoreError> {
            if self.hang_increment {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.always_stale {
                return Ok(IncrementOutcome::PeriodStale);
            }
            self.inner
                .increment_within_limit(tenant, counter, amount, limit, expected_period_start, now)
                .await
        }

        async fn atomic_decrement(
            &self,
            tenant: &TenantId,
            counter: Counter,
            amount: u64,
            now: DateTime<Utc>,
        ) -> std::result::Result<u64, StoreError> {
            self.inner.atomic_decrement(tenant, counter, amount, now).await
        }

        async fn reset_resettable_counters(
            &self,
            tenant: &TenantId,
            expected_end: DateTime<Utc>,
            next: BillingPeriod,
            now: DateTime<Utc>,
        ) -> std::result::Result<ResetOutcome, StoreError> {
            self.inner
                .reset_resettable_counters(tenant, expected_end, next, now)
                .await
        }
    }

    fn meter_over(store: Arc<FaultyStore>) -> UsageMeter {
        UsageMeter::new(
            Arc::new(QuotaPolicy::builtin()),
            store,
            resolver_for(SubscriptionSnapshot::active(Tier::Creator)),
            Arc::new(InMemoryAuditLog::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_store_unavailable_is_distinct_from_quota_denial() {
        let store = Arc::new(FaultyStore {
            fail_reads: true,
            ..FaultyStore::new()
        });
        let meter = meter_over(store);

        let result = meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.denial, Some(DenialReason::StoreUnavailable));
        assert!(!result.is_quota_denial());
        assert!(result.retryable);
        assert_eq!(meter.metrics().infra_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_conflict_retries_exhausted() {
        let store = Arc::new(FaultyStore {
            always_stale: true,
            ..FaultyStore::new()
        });
        let meter = meter_over(store.clone());

        let result = meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert_eq!(result.denial, Some(DenialReason::ConcurrencyConflict));
        assert!(result.retryable);
        assert_eq!(store.inner.get(&tenant()).await.unwrap().unwrap().ai_credits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_timeout_is_unknown_outcome() {
        let store = Arc::new(FaultyStore {
            hang_increment: true,
            ..FaultyStore::new()
        });
        let meter = meter_over(store);

        let result = meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap();
        assert_eq!(result.denial, Some(DenialReason::OutcomeUnknown));
        assert!(!result.retryable);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consume_never_overshoots() {
        let h = harness(Tier::Creator);
        seed(&h.store, current_period(), |r| r.ai_credits = 295);
        let meter = Arc::new(h.meter);

        let mut handles = Vec::new();
        for _ in 0..40 {
            let meter = meter.clone();
            handles.push(tokio::spawn(async move {
                meter.consume(&tenant(), Feature::AiCredits, 1).await.unwrap().success
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 5);
        assert_eq!(h.store.get(&tenant()).await.unwrap().unwrap().ai_credits, 300);
    }
}
