//! Metering outcomes
//!
//! Quota denials are values, not errors. Everything a caller needs to render
//! "You've used 300/300 AI credits, resets Dec 1" travels in the outcome.

use chrono::{DateTime, Utc};
use quotaguard_common::{Counter, Limit, UsageRecord};
use serde::{Deserialize, Serialize};

/// Usage of one feature against its ceiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the requested amount fits under the ceiling
    pub allowed: bool,
    pub used: u64,
    pub limit: Limit,
    pub percentage: f64,
    /// Next period boundary; absent for cumulative counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_date: Option<DateTime<Utc>>,
}

impl Decision {
    /// Evaluate `amount` more units of `counter` against `limit`
    pub fn evaluate(record: &UsageRecord, counter: Counter, limit: Limit, amount: u64) -> Self {
        Self::from_parts(
            record.used(counter),
            limit,
            limit.admits(record.used(counter), amount),
            counter,
            record.current_period_end,
        )
    }

    pub(crate) fn from_parts(
        used: u64,
        limit: Limit,
        allowed: bool,
        counter: Counter,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed,
            used,
            limit,
            percentage: limit.percentage(used),
            reset_date: counter.is_resettable().then_some(period_end),
        }
    }

    /// Decision for a feature the tier has no ceiling for
    pub(crate) fn unmapped(used: u64) -> Self {
        Self {
            allowed: false,
            used,
            limit: Limit::Limited(0),
            percentage: 100.0,
            reset_date: None,
        }
    }
}

/// Why a `consume` call was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The ceiling would be crossed
    QuotaExceeded,
    /// The feature has no ceiling under the tenant's tier
    UnmappedFeature,
    /// The usage store could not be reached
    StoreUnavailable,
    /// The billing provider could not be reached
    SubscriptionUnavailable,
    /// Period rollovers kept racing the increment
    ConcurrencyConflict,
    /// The increment timed out and may or may not have been applied
    OutcomeUnknown,
}

impl DenialReason {
    /// Whether retrying the same `consume` call is safe and may succeed
    ///
    /// An unknown outcome is not retryable: the caller must re-check usage first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DenialReason::StoreUnavailable
                | DenialReason::SubscriptionUnavailable
                | DenialReason::ConcurrencyConflict
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::QuotaExceeded => "quota_exceeded",
            DenialReason::UnmappedFeature => "unmapped_feature",
            DenialReason::StoreUnavailable => "store_unavailable",
            DenialReason::SubscriptionUnavailable => "subscription_unavailable",
            DenialReason::ConcurrencyConflict => "concurrency_conflict",
            DenialReason::OutcomeUnknown => "outcome_unknown",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `consume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<DenialReason>,
    pub retryable: bool,
}

impl ConsumeResult {
    pub(crate) fn allowed(counter: Counter, amount: u64, usage: Decision) -> Self {
        Self {
            success: true,
            message: format!(
                "Used {} {} ({}/{})",
                amount,
                counter.display_name(),
                usage.used,
                usage.limit
            ),
            usage: Some(usage),
            denial: None,
            retryable: false,
        }
    }

    pub(crate) fn exceeded(counter: Counter, usage: Decision) -> Self {
        Self {
            success: false,
            message: quota_message(counter, &usage),
            usage: Some(usage),
            denial: Some(DenialReason::QuotaExceeded),
            retryable: false,
        }
    }

    pub(crate) fn denied(reason: DenialReason, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            usage: None,
            denial: Some(reason),
            retryable: reason.is_retryable(),
        }
    }

    /// True for a genuine quota denial, as opposed to an infrastructure failure
    pub fn is_quota_denial(&self) -> bool {
        self.denial == Some(DenialReason::QuotaExceeded)
    }
}

/// "You've used 300/300 AI credits, resets Dec 1"
pub fn quota_message(counter: Counter, usage: &Decision) -> String {
    let mut message = format!(
        "You've used {}/{} {}",
        usage.used,
        usage.limit,
        counter.display_name()
    );
    if let Some(reset) = usage.reset_date {
        message.push_str(&format!(", resets {}", reset.format("%b %-d")));
    }
    message
}
