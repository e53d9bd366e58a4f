//! Meterable features and the counters they are accounted against
//!
//! [`Feature`] is what callers ask for; [`Counter`] is what gets stored.
//! Composite features map onto a base counter through [`Feature::counter`].
//! That mapping decides what tenants are limited for, so it is an exhaustive
//! `match` and any change to it is a billing change.

use serde::{Deserialize, Serialize};

use crate::error::QuotaError;

/// Whether a counter survives billing-period rollover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Zeroed at every period boundary
    Resettable,
    /// Changed only by explicit add/remove of the underlying resource
    Cumulative,
}

/// Stored usage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    AiCredits,
    AiEdits,
    SocialSets,
    StorageGb,
    ContextFiles,
    ApiCalls,
}

impl Counter {
    pub const ALL: [Counter; 6] = [
        Counter::AiCredits,
        Counter::AiEdits,
        Counter::SocialSets,
        Counter::StorageGb,
        Counter::ContextFiles,
        Counter::ApiCalls,
    ];

    pub const RESETTABLE: [Counter; 3] = [Counter::AiCredits, Counter::AiEdits, Counter::ApiCalls];

    pub fn kind(&self) -> CounterKind {
        match self {
            Counter::AiCredits | Counter::AiEdits | Counter::ApiCalls => CounterKind::Resettable,
            Counter::SocialSets | Counter::StorageGb | Counter::ContextFiles => {
                CounterKind::Cumulative
            }
        }
    }

    pub fn is_resettable(&self) -> bool {
        self.kind() == CounterKind::Resettable
    }

    /// Wire and storage field name
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::AiCredits => "ai_credits",
            Counter::AiEdits => "ai_edits",
            Counter::SocialSets => "social_sets",
            Counter::StorageGb => "storage_gb",
            Counter::ContextFiles => "context_files",
            Counter::ApiCalls => "api_calls",
        }
    }

    /// Human-readable unit used in denial messages
    pub fn display_name(&self) -> &'static str {
        match self {
            Counter::AiCredits => "AI credits",
            Counter::AiEdits => "AI edits",
            Counter::SocialSets => "social sets",
            Counter::StorageGb => "GB of storage",
            Counter::ContextFiles => "context files",
            Counter::ApiCalls => "API calls",
        }
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Counter {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Counter::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| QuotaError::UnknownFeature(s.to_string()))
    }
}

/// Feature a caller meters against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    AiCredits,
    AiEdits,
    SocialSets,
    StorageGb,
    ContextFiles,
    ApiCalls,
    /// Creating a post, accounted as an API call
    PostCreation,
    /// Scheduling a post, accounted as an API call
    Scheduling,
    /// Processing a video, accounted as AI credits
    VideoProcessing,
}

impl Feature {
    pub const ALL: [Feature; 9] = [
        Feature::AiCredits,
        Feature::AiEdits,
        Feature::SocialSets,
        Feature::StorageGb,
        Feature::ContextFiles,
        Feature::ApiCalls,
        Feature::PostCreation,
        Feature::Scheduling,
        Feature::VideoProcessing,
    ];

    /// Counter this feature is accounted against
    pub fn counter(&self) -> Counter {
        match self {
            Feature::AiCredits => Counter::AiCredits,
            Feature::AiEdits => Counter::AiEdits,
            Feature::SocialSets => Counter::SocialSets,
            Feature::StorageGb => Counter::StorageGb,
            Feature::ContextFiles => Counter::ContextFiles,
            Feature::ApiCalls => Counter::ApiCalls,
            Feature::PostCreation => Counter::ApiCalls,
            Feature::Scheduling => Counter::ApiCalls,
            Feature::VideoProcessing => Counter::AiCredits,
        }
    }

    /// True for features that are themselves a stored counter
    pub fn is_base(&self) -> bool {
        Feature::from(self.counter()) == *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::AiCredits => "ai_credits",
            Feature::AiEdits => "ai_edits",
            Feature::SocialSets => "social_sets",
            Feature::StorageGb => "storage_gb",
            Feature::ContextFiles => "context_files",
            Feature::ApiCalls => "api_calls",
            Feature::PostCreation => "post_creation",
            Feature::Scheduling => "scheduling",
            Feature::VideoProcessing => "video_processing",
        }
    }
}

impl From<Counter> for Feature {
    fn from(counter: Counter) -> Self {
        match counter {
            Counter::AiCredits => Feature::AiCredits,
            Counter::AiEdits => Feature::AiEdits,
            Counter::SocialSets => Feature::SocialSets,
            Counter::StorageGb => Feature::StorageGb,
            Counter::ContextFiles => Feature::ContextFiles,
            Counter::ApiCalls => Feature::ApiCalls,
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| QuotaError::UnknownFeature(s.to_string()))
    }
}
