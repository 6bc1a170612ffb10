//! Domain types and configuration for the voice-of-customer pipeline.
//!
//! Everything here is plain data: no I/O beyond reading environment variables.

#[macro_use]
mod macros;

pub mod alerts;
pub mod app_config;
pub mod config;
pub mod feedback;
pub mod insights;
pub mod runs;
pub mod sources;
pub mod stats;
pub mod subscribers;
pub mod themes;

use thiserror::Error;

pub use alerts::{
    AlertDelivery, AlertEvent, AlertRule, AlertStatus, ChannelKind, ChannelTarget,
    DeliveryStatus, NewAlertEvent, NewAlertRule, NewDelivery, RuleType, Severity,
};
pub use app_config::{AppConfig, Environment};
pub use config::{load_app_config, load_app_config_from_env};
pub use feedback::{DiscardReason, ExtractionStatus, Feedback, NewDiscard, NewFeedback};
pub use insights::{
    CompetitorMention, CustomerContext, FeaturePriority, FeatureRequest, Insight, JourneyStage,
    MentionSentiment, NewInsight, PainPoint, PainSeverity, SentimentLabel, WindowInsight,
};
pub use runs::{CrawlRun, CrawlStats, CrawlStatus};
pub use sources::{
    G2Config, NewSource, Platform, QuoraConfig, RedditConfig, RedditSort, RedditTimeFilter,
    Source, SourceConfig, SourceConfigError, TrustpilotConfig, TwitterConfig, TwitterResultType,
    YoutubeConfig,
};
pub use stats::{ExtractionUsage, NewExtractionBatch, PipelineStats};
pub use subscribers::{parse_subscribers, SubscriberEvent, WebhookSubscriber};
pub use themes::{cosine_similarity, moving_average, InsightTheme, Theme, ThemeCentroid};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

/// A stored or submitted string did not match any known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}
