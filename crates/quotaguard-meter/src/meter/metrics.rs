//! Prometheus metrics for the meter

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

use super::decision::DenialReason;

/// Operational counters; per-tenant usage is never exported here
pub struct MeterMetrics {
    pub decisions_allowed: IntCounter,
    /// Labelled by denial reason
    pub decisions_denied: IntCounterVec,
    pub infra_failures: IntCounter,
    pub resets: IntCounter,
    pub audit_failures: IntCounter,
    pub consume_duration_seconds: Histogram,
}

impl MeterMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            decisions_allowed: IntCounter::new(
                "quotaguard_decisions_allowed_total",
                "Consume calls that were allowed",
            )?,
            decisions_denied: IntCounterVec::new(
                Opts::new(
                    "quotaguard_decisions_denied_total",
                    "Consume calls that were denied",
                ),
                &["reason"],
            )?,
            infra_failures: IntCounter::new(
                "quotaguard_infra_failures_total",
                "Store or billing provider failures",
            )?,
            resets: IntCounter::new(
                "quotaguard_resets_total",
                "Billing-period resets applied",
            )?,
            audit_failures: IntCounter::new(
                "quotaguard_audit_failures_total",
                "Audit entries that could not be written",
            )?,
            consume_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "quotaguard_consume_duration_seconds",
                    "Consume call duration",
                )
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.decisions_allowed.clone()))?;
        registry.register(Box::new(self.decisions_denied.clone()))?;
        registry.register(Box::new(self.infra_failures.clone()))?;
        registry.register(Box::new(self.resets.clone()))?;
        registry.register(Box::new(self.audit_failures.clone()))?;
        registry.register(Box::new(self.consume_duration_seconds.clone()))?;
        Ok(())
    }

    pub(crate) fn denied(&self, reason: DenialReason) {
        self.decisions_denied.with_label_values(&[reason.as_str()]).inc();
        if !matches!(reason, DenialReason::QuotaExceeded | DenialReason::UnmappedFeature) {
            self.infra_failures.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_count() {
        let metrics = MeterMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        metrics.denied(DenialReason::QuotaExceeded);
        metrics.denied(DenialReason::StoreUnavailable);

        assert_eq!(
            metrics
                .decisions_denied
                .with_label_values(&["quota_exceeded"])
                .get(),
            1
        );
        assert_eq!(metrics.infra_failures.get(), 1);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn test_double_registration_fails() {
        let metrics = MeterMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}
