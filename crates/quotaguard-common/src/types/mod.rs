//! Core data types for QuotaGuard

pub mod feature;
pub mod limit;
pub mod period;
pub mod tenant;
pub mod tier;
pub mod usage_record;
