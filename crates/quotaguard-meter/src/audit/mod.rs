//! Usage audit log
//!
//! Append-only record of metering decisions and counter transitions, used for
//! dispute resolution. Writes are best-effort from the meter's point of view:
//! a failed append is logged and dropped, never surfaced to the caller.

mod memory;
mod redis_log;
mod tracing_log;

pub use memory::InMemoryAuditLog;
pub use redis_log::RedisAuditLog;
pub use tracing_log::TracingAuditLog;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quotaguard_common::{Counter, Feature, QuotaError, StoreError, TenantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// What the audited operation tried to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Bounded consumption through the meter
    Consume,
    /// Unconditional post-hoc usage
    Record,
    /// Cumulative resource removed
    Release,
    /// Billing-period rollover
    Reset,
}

/// How the operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allowed,
    Denied,
    Applied,
}

/// Immutable audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unique, time-ordered entry ID
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// Feature the caller named
    pub feature: Feature,
    /// Counter the feature is accounted against
    pub counter: Counter,
    pub action: AuditAction,
    pub amount_requested: u64,
    pub decision: AuditDecision,
    /// Counter value after the operation, when known
    pub resulting_total: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AuditEntry {
    pub fn new(
        tenant_id: TenantId,
        feature: Feature,
        action: AuditAction,
        amount_requested: u64,
        decision: AuditDecision,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            feature,
            counter: feature.counter(),
            action,
            amount_requested,
            decision,
            resulting_total: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.resulting_total = Some(total);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Whether this entry belongs in a history filtered by `feature`
    ///
    /// A base feature selects every entry on its counter, composites included;
    /// a composite feature selects only its own entries.
    pub fn matches(&self, feature: Option<Feature>) -> bool {
        match feature {
            None => true,
            Some(f) if f.is_base() => self.counter == f.counter(),
            Some(f) => self.feature == f,
        }
    }
}

/// Audit log errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuditError {
    #[error("Audit log unavailable: {0}")]
    Unavailable(String),

    #[error("Audit serialization error: {0}")]
    Serialization(String),
}

impl From<AuditError> for QuotaError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Unavailable(msg) => QuotaError::Store(StoreError::Unavailable(msg)),
            AuditError::Serialization(msg) => QuotaError::Serialization(msg),
        }
    }
}

/// Append-only audit sink with a newest-first read path
#[async_trait]
pub trait UsageAuditLog: Send + Sync {
    /// Append an entry
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;

    /// Up to `limit` entries for a tenant, newest first
    async fn history(
        &self,
        tenant: &TenantId,
        feature: Option<Feature>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, AuditError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(feature: Feature) -> AuditEntry {
        AuditEntry::new(
            TenantId::new("tenant-a").unwrap(),
            feature,
            AuditAction::Consume,
            1,
            AuditDecision::Allowed,
        )
    }

    #[test]
    fn test_entry_maps_counter() {
        let e = entry(Feature::VideoProcessing).with_total(12).with_detail("tier", "pro");
        assert_eq!(e.counter, Counter::AiCredits);
        assert_eq!(e.resulting_total, Some(12));
        assert_eq!(e.metadata.get("tier"), Some(&"pro".to_string()));
    }

    #[test]
    fn test_feature_filter() {
        let post = entry(Feature::PostCreation);
        assert!(post.matches(None));
        assert!(post.matches(Some(Feature::ApiCalls)));
        assert!(post.matches(Some(Feature::PostCreation)));
        assert!(!post.matches(Some(Feature::Scheduling)));
        assert!(!post.matches(Some(Feature::AiCredits)));
    }

    #[test]
    fn test_entry_json_shape() {
        let json = serde_json::to_value(entry(Feature::AiEdits)).unwrap();
        assert_eq!(json["tenantId"], "tenant-a");
        assert_eq!(json["feature"], "ai_edits");
        assert_eq!(json["decision"], "allowed");
        assert!(json.get("metadata").is_none());
    }
}
