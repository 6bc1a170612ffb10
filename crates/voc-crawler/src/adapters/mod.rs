//! One adapter per platform.

mod g2;
mod jsonld;
mod quora;
mod reddit;
mod trustpilot;
mod twitter;
mod youtube;

use std::sync::Arc;

pub use g2::G2Adapter;
pub use quora::QuoraAdapter;
pub use reddit::RedditAdapter;
pub use trustpilot::TrustpilotAdapter;
pub use twitter::TwitterAdapter;
pub use youtube::YoutubeAdapter;

use crate::adapter::AdapterRegistry;
use crate::client::PoliteClient;
use crate::error::CrawlError;
use voc_core::Platform;

/// Registry with every built-in adapter pointed at its production host.
///
/// Twitter needs an API bearer token; without one its fetches fail as blocked.
#[must_use]
pub fn default_registry(
    client: &Arc<PoliteClient>,
    twitter_bearer_token: Option<String>,
) -> AdapterRegistry {
    AdapterRegistry::new()
        .with(Arc::new(RedditAdapter::new(Arc::clone(client))))
        .with(Arc::new(YoutubeAdapter::new(Arc::clone(client))))
        .with(Arc::new(TrustpilotAdapter::new(Arc::clone(client))))
        .with(Arc::new(G2Adapter::new(Arc::clone(client))))
        .with(Arc::new(TwitterAdapter::new(
            Arc::clone(client),
            twitter_bearer_token,
        )))
        .with(Arc::new(QuoraAdapter::new(Arc::clone(client))))
}

fn wrong_platform(expected: Platform, got: Platform) -> CrawlError {
    CrawlError::InvalidConfig(format!("{expected} adapter received a {got} source config"))
}

fn trim_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}
