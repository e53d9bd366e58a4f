//! Subscription tiers and billing status
//!
//! Tiers are ordered from most to least restrictive. The billing provider owns
//! which tier a tenant is on; this crate only models the snapshot it returns.

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Subscription plan determining per-feature ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Free plan, the most restrictive tier
    Spark,
    Creator,
    Growth,
    Pro,
    Enterprise,
}

impl Tier {
    /// Tier used whenever the real tier cannot be trusted
    pub const RESTRICTIVE: Tier = Tier::Spark;

    /// All tiers, most restrictive first
    pub const ALL: [Tier; 5] = [
        Tier::Spark,
        Tier::Creator,
        Tier::Growth,
        Tier::Pro,
        Tier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Spark => "spark",
            Tier::Creator => "creator",
            Tier::Growth => "growth",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Parse a tier name, falling back to [`Tier::RESTRICTIVE`] when unrecognized
    pub fn parse_or_restrictive(name: &str) -> Tier {
        name.parse().unwrap_or(Tier::RESTRICTIVE)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spark" => Ok(Tier::Spark),
            "creator" => Ok(Tier::Creator),
            "growth" => Ok(Tier::Growth),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(PolicyError::UnknownTier(s.to_string())),
        }
    }
}

/// Billing state reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

/// Read-only `{tier, status}` value fetched once per metering decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub tier: Tier,
    pub status: SubscriptionStatus,
}

impl SubscriptionSnapshot {
    pub fn new(tier: Tier, status: SubscriptionStatus) -> Self {
        Self { tier, status }
    }

    pub fn active(tier: Tier) -> Self {
        Self::new(tier, SubscriptionStatus::Active)
    }
}
