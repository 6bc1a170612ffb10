//! Platform crawlers for the voice-of-customer pipeline.
//!
//! Every platform sits behind [`CrawlerAdapter`]; the crawl job handler looks
//! adapters up in an [`AdapterRegistry`] by [`voc_core::Platform`]. All HTTP
//! goes through [`PoliteClient`], which honours robots.txt and the
//! per-platform request spacing.

pub mod adapter;
pub mod adapters;
pub mod client;
pub mod error;
pub mod retry;
pub mod robots;
pub mod types;

pub use adapter::{AdapterRegistry, CrawlerAdapter};
pub use adapters::{
    default_registry, G2Adapter, QuoraAdapter, RedditAdapter, TrustpilotAdapter, TwitterAdapter,
    YoutubeAdapter,
};
pub use client::PoliteClient;
pub use error::{CrawlError, DEFAULT_RETRY_AFTER_SECS};
pub use retry::{retry_with_backoff, Retriable, RetryPolicy};
pub use robots::RobotsRules;
pub use types::{FetchOutcome, RawRecord};
