//! Per-feature ceilings
//!
//! Serialized as a plain integer, or as the string `"unlimited"`.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// Ceiling on a counter within a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    Limited(u64),
    Unlimited,
}

impl Limit {
    pub const UNLIMITED_SENTINEL: &'static str = "unlimited";

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// Ceiling as a number, `None` when unlimited
    pub fn value(&self) -> Option<u64> {
        match self {
            Limit::Limited(max) => Some(*max),
            Limit::Unlimited => None,
        }
    }

    /// Whether `used + amount` stays within the ceiling
    pub fn admits(&self, used: u64, amount: u64) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Limited(max) => used
                .checked_add(amount)
                .map(|total| total <= *max)
                .unwrap_or(false),
        }
    }

    /// Share of the ceiling already used, in percent
    ///
    /// Unlimited ceilings always report 0. A zero ceiling reports 100.
    pub fn percentage(&self, used: u64) -> f64 {
        match self {
            Limit::Unlimited => 0.0,
            Limit::Limited(0) => 100.0,
            Limit::Limited(max) => (used as f64 / *max as f64) * 100.0,
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Limited(max) => write!(f, "{}", max),
            Limit::Unlimited => f.write_str(Self::UNLIMITED_SENTINEL),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Limited(max) => serializer.serialize_u64(*max),
            Limit::Unlimited => serializer.serialize_str(Self::UNLIMITED_SENTINEL),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LimitVisitor;

        impl<'de> Visitor<'de> for LimitVisitor {
            type Value = Limit;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a non-negative integer or \"unlimited\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Limit, E> {
                Ok(Limit::Limited(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Limit, E> {
                u64::try_from(v)
                    .map(Limit::Limited)
                    .map_err(|_| E::custom(format!("limit cannot be negative: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Limit, E> {
                if v.eq_ignore_ascii_case(Limit::UNLIMITED_SENTINEL) {
                    Ok(Limit::Unlimited)
                } else {
                    Err(E::invalid_value(de::Unexpected::Str(v), &self))
                }
            }
        }

        deserializer.deserialize_any(LimitVisitor)
    }
}
