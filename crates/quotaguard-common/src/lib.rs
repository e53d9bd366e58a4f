//! # QuotaGuard Common
//!
//! Shared types and errors for the QuotaGuard usage metering engine.
//!
//! ## Core Types
//!
//! - [`TenantId`]: opaque identifier of a metered account
//! - [`Tier`] / [`SubscriptionStatus`]: subscription plan and billing state
//! - [`Counter`]: the six stored usage counters, each [`CounterKind::Resettable`]
//!   or [`CounterKind::Cumulative`]
//! - [`Feature`]: closed set of meterable features, mapped onto a [`Counter`]
//! - [`Limit`]: a per-feature ceiling or [`Limit::Unlimited`]
//! - [`BillingPeriod`]: calendar-month window over which resettable counters accrue
//! - [`UsageRecord`]: the per-tenant usage document

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{PolicyError, QuotaError, Result, StoreError};
pub use types::{
    feature::{Counter, CounterKind, Feature},
    limit::Limit,
    period::BillingPeriod,
    tenant::TenantId,
    tier::{SubscriptionSnapshot, SubscriptionStatus, Tier},
    usage_record::UsageRecord,
};

/// QuotaGuard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of audit entries returned by a history query
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound on a single history query
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Largest amount or finite ceiling the engine accepts
///
/// Counters must stay exact in every backend, including Lua numbers (IEEE
/// doubles) inside Redis scripts, so they are capped at 2^53 - 1.
pub const MAX_AMOUNT: u64 = (1 << 53) - 1;
