//! Tenant identity
//!
//! Tenants are authenticated upstream; this crate only carries the opaque id.

use serde::{Deserialize, Serialize};

use crate::error::QuotaError;

/// Opaque identifier of a metered account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id, rejecting empty or whitespace-only input
    pub fn new(id: impl Into<String>) -> Result<Self, QuotaError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(QuotaError::InvalidTenant);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TenantId {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
