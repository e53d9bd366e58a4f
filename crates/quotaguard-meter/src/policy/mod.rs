//! Quota policy
//!
//! Immutable mapping from tier to per-counter ceiling, loaded once at start-up
//! from the built-in table or a JSON document:
//!
//! ```json
//! { "spark": { "ai_credits": 50, "api_calls": 100 },
//!   "enterprise": { "ai_credits": "unlimited" } }
//! ```
//!
//! Two fail-closed rules apply to lookups:
//! - a tier missing from the document is evaluated as [`Tier::RESTRICTIVE`]
//! - a counter missing from a tier is unmapped and denied, never unlimited

mod table;

pub use table::builtin_limit;

use std::collections::HashMap;
use std::path::Path;

use quotaguard_common::{Counter, Feature, Limit, PolicyError, QuotaError, Result, Tier, MAX_AMOUNT};
use tracing::{debug, info, instrument};

/// Tier -> counter -> ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaPolicy {
    tiers: HashMap<Tier, HashMap<Counter, Limit>>,
}

impl QuotaPolicy {
    /// Policy from the built-in table
    pub fn builtin() -> Self {
        let tiers = Tier::ALL
            .into_iter()
            .map(|tier| {
                let limits = Counter::ALL
                    .into_iter()
                    .map(|counter| (counter, builtin_limit(tier, counter)))
                    .collect();
                (tier, limits)
            })
            .collect();
        Self { tiers }
    }

    /// Build a policy from an explicit table
    pub fn from_table(tiers: HashMap<Tier, HashMap<Counter, Limit>>) -> Result<Self> {
        if !tiers.contains_key(&Tier::RESTRICTIVE) {
            return Err(PolicyError::MissingRestrictiveTier(Tier::RESTRICTIVE).into());
        }
        for (tier, limits) in &tiers {
            for (counter, limit) in limits {
                if limit.value().is_some_and(|max| max > MAX_AMOUNT) {
                    return Err(PolicyError::Invalid(format!(
                        "{} ceiling for {} exceeds {}",
                        counter, tier, MAX_AMOUNT
                    ))
                    .into());
                }
            }
        }
        Ok(Self { tiers })
    }

    /// Parse a JSON policy document
    pub fn from_json(json: &str) -> Result<Self> {
        let tiers: HashMap<Tier, HashMap<Counter, Limit>> = serde_json::from_str(json)
            .map_err(|e| QuotaError::Policy(PolicyError::Invalid(e.to_string())))?;
        Self::from_table(tiers)
    }

    /// Load a JSON policy document from disk
    #[instrument]
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            QuotaError::Config(format!("Failed to read policy {}: {}", path.display(), e))
        })?;
        let policy = Self::from_json(&json)?;
        info!(tiers = policy.tiers.len(), "Loaded quota policy");
        Ok(policy)
    }

    /// Ceiling for a feature under a tier
    ///
    /// Unknown tiers resolve to the restrictive tier; unmapped counters are an error
    /// the meter turns into a denial.
    pub fn limit_for(&self, tier: Tier, feature: Feature) -> std::result::Result<Limit, PolicyError> {
        let counter = feature.counter();
        let (effective, limits) = match self.tiers.get(&tier) {
            Some(limits) => (tier, limits),
            None => {
                debug!(%tier, "Tier absent from policy, using restrictive tier");
                let limits = self
                    .tiers
                    .get(&Tier::RESTRICTIVE)
                    .ok_or(PolicyError::MissingRestrictiveTier(Tier::RESTRICTIVE))?;
                (Tier::RESTRICTIVE, limits)
            }
        };

        limits.get(&counter).copied().ok_or(PolicyError::Unmapped {
            tier: effective,
            counter,
        })
    }

    /// [`Self::limit_for`] over a raw tier name
    pub fn limit_for_name(
        &self,
        tier_name: &str,
        feature: Feature,
    ) -> std::result::Result<Limit, PolicyError> {
        self.limit_for(Tier::parse_or_restrictive(tier_name), feature)
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}
