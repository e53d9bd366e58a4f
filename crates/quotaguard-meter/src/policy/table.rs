//! Built-in quota table
//!
//! Exhaustive over `(Tier, Counter)`: adding a tier or a counter does not
//! compile until every ceiling for it is written down here.

use quotaguard_common::{Counter, Limit, Tier};

use Limit::{Limited, Unlimited};

/// Ceiling shipped with the binary for a tier/counter pair
pub fn builtin_limit(tier: Tier, counter: Counter) -> Limit {
    match (tier, counter) {
        (Tier::Spark, Counter::AiCredits) => Limited(50),
        (Tier::Spark, Counter::AiEdits) => Limited(10),
        (Tier::Spark, Counter::SocialSets) => Limited(1),
        (Tier::Spark, Counter::StorageGb) => Limited(1),
        (Tier::Spark, Counter::ContextFiles) => Limited(3),
        (Tier::Spark, Counter::ApiCalls) => Limited(100),

        (Tier::Creator, Counter::AiCredits) => Limited(300),
        (Tier::Creator, Counter::AiEdits) => Limited(50),
        (Tier::Creator, Counter::SocialSets) => Limited(3),
        (Tier::Creator, Counter::StorageGb) => Limited(10),
        (Tier::Creator, Counter::ContextFiles) => Limited(10),
        (Tier::Creator, Counter::ApiCalls) => Limited(1_000),

        (Tier::Growth, Counter::AiCredits) => Limited(1_000),
        (Tier::Growth, Counter::AiEdits) => Limited(200),
        (Tier::Growth, Counter::SocialSets) => Limited(5),
        (Tier::Growth, Counter::StorageGb) => Limited(50),
        (Tier::Growth, Counter::ContextFiles) => Limited(25),
        (Tier::Growth, Counter::ApiCalls) => Limited(5_000),

        (Tier::Pro, Counter::AiCredits) => Limited(3_000),
        (Tier::Pro, Counter::AiEdits) => Limited(1_000),
        (Tier::Pro, Counter::SocialSets) => Limited(10),
        (Tier::Pro, Counter::StorageGb) => Limited(200),
        (Tier::Pro, Counter::ContextFiles) => Limited(100),
        (Tier::Pro, Counter::ApiCalls) => Limited(20_000),

        (Tier::Enterprise, _) => Unlimited,
    }
}
