//! Error types for QuotaGuard
//!
//! Provides a unified error type and domain-specific error variants.
//! Quota denials are not errors; they are ordinary decision outcomes.

use thiserror::Error;

use crate::types::{feature::Counter, tier::Tier};

/// Result type alias using QuotaError
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Unified error type for QuotaGuard operations
#[derive(Debug, Error)]
pub enum QuotaError {
    // Caller errors
    #[error("Amount must be a positive integer no greater than 2^53 - 1")]
    InvalidAmount,

    #[error("Tenant id must not be empty")]
    InvalidTenant,

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    // Policy errors
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    // Storage errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Billing provider errors
    #[error("Subscription resolution failed: {0}")]
    Subscription(String),

    // Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuotaError {
    /// Whether retrying the whole operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QuotaError::Store(StoreError::Unavailable(_))
                | QuotaError::Subscription(_)
                | QuotaError::Timeout(_)
        )
    }
}

/// Quota policy errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Unrecognized tier: {0}")]
    UnknownTier(String),

    #[error("Counter {counter} has no ceiling for tier {tier}")]
    Unmapped { tier: Tier, counter: Counter },

    #[error("Policy is missing the restrictive tier {0}")]
    MissingRestrictiveTier(Tier),

    #[error("Counter {0} is reset each period and cannot be released")]
    NotCumulative(Counter),

    #[error("Invalid policy document: {0}")]
    Invalid(String),
}

/// Usage store errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Usage record not found for tenant {0}")]
    NotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt usage record for tenant {tenant}: {reason}")]
    Corrupt { tenant: String, reason: String },
}

// Implement From for common external error types
impl From<serde_json::Error> for QuotaError {
    fn from(err: serde_json::Error) -> Self {
        QuotaError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for QuotaError {
    fn from(err: std::io::Error) -> Self {
        QuotaError::Config(err.to_string())
    }
}

impl From<anyhow::Error> for QuotaError {
    fn from(err: anyhow::Error) -> Self {
        QuotaError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QuotaError::Store(StoreError::NotFound("tenant-a".to_string()));
        assert!(err.to_string().contains("tenant-a"));
    }

    #[test]
    fn test_unmapped_display() {
        let err = PolicyError::Unmapped {
            tier: Tier::Growth,
            counter: Counter::ContextFiles,
        };
        assert_eq!(
            err.to_string(),
            "Counter context_files has no ceiling for tier growth"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(QuotaError::Timeout("store get".into()).is_transient());
        assert!(QuotaError::Store(StoreError::Unavailable("down".into())).is_transient());
        assert!(!QuotaError::InvalidAmount.is_transient());
        assert!(!QuotaError::Policy(PolicyError::UnknownTier("x".into())).is_transient());
    }
}
