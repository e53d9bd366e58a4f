//! In-memory audit log

use async_trait::async_trait;
use dashmap::DashMap;
use quotaguard_common::{Feature, TenantId};

use super::{AuditEntry, AuditError, UsageAuditLog};

/// Per-tenant append-only vectors
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: DashMap<TenantId, Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded for a tenant
    pub fn count(&self, tenant: &TenantId) -> usize {
        self.entries.get(tenant).map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl UsageAuditLog for InMemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries
            .entry(entry.tenant_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn history(
        &self,
        tenant: &TenantId,
        feature: Option<Feature>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .entries
            .get(tenant)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .filter(|e| e.matches(feature))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditDecision};

    #[tokio::test]
    async fn test_history_newest_first_and_filtered() {
        let log = InMemoryAuditLog::new();
        let tenant = TenantId::new("tenant-a").unwrap();

        for (i, feature) in [Feature::AiCredits, Feature::PostCreation, Feature::AiCredits]
            .into_iter()
            .enumerate()
        {
            let entry = AuditEntry::new(
                tenant.clone(),
                feature,
                AuditAction::Consume,
                i as u64 + 1,
                AuditDecision::Allowed,
            );
            log.record(entry).await.unwrap();
        }

        let all = log.history(&tenant, None, 50).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.amount_requested).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );

        let credits = log.history(&tenant, Some(Feature::AiCredits), 1).await.unwrap();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].amount_requested, 3);

        let other = TenantId::new("tenant-b").unwrap();
        assert!(log.history(&other, None, 50).await.unwrap().is_empty());
        assert_eq!(log.count(&tenant), 3);
    }
}
