//! Log-stream mirror for audit entries

use async_trait::async_trait;
use quotaguard_common::{Feature, TenantId};
use tracing::info;

use super::{AuditDecision, AuditEntry, AuditError, UsageAuditLog};

/// Writes every entry to the `quotaguard::audit` tracing target, then
/// forwards it to the wrapped log
pub struct TracingAuditLog<L> {
    inner: L,
}

impl<L: UsageAuditLog> TracingAuditLog<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: UsageAuditLog> UsageAuditLog for TracingAuditLog<L> {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let total = entry
            .resulting_total
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        let decision = match entry.decision {
            AuditDecision::Allowed => "allowed",
            AuditDecision::Denied => "denied",
            AuditDecision::Applied => "applied",
        };

        info!(
            target: "quotaguard::audit",
            id = %entry.id,
            tenant = %entry.tenant_id,
            feature = %entry.feature,
            action = ?entry.action,
            amount = entry.amount_requested,
            total = %total,
            "{}",
            decision
        );

        self.inner.record(entry).await
    }

    async fn history(
        &self,
        tenant: &TenantId,
        feature: Option<Feature>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        self.inner.history(tenant, feature, limit).await
    }
}
