//! The crawler capability interface and the registry the crawl handler uses
//! to pick an adapter for a source.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use voc_core::{Platform, SourceConfig};

use crate::types::FetchOutcome;

#[async_trait]
pub trait CrawlerAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Fetch up to `limit` records for `config`.
    ///
    /// Never panics on upstream failure: errors come back inside the outcome,
    /// next to any records already collected.
    async fn fetch(&self, config: &SourceConfig, limit: usize) -> FetchOutcome;
}

/// Adapters keyed by platform.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn CrawlerAdapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for the same platform.
    pub fn register(&mut self, adapter: Arc<dyn CrawlerAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn CrawlerAdapter>) -> Self {
        self.register(adapter);
        self
    }

    #[must_use]
    pub fn get(&self, platform: Platform) -> Option<Arc<dyn CrawlerAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    #[must_use]
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub(Platform);

    #[async_trait]
    impl CrawlerAdapter for Stub {
        fn platform(&self) -> Platform {
            self.0
        }

        async fn fetch(&self, _config: &SourceConfig, _limit: usize) -> FetchOutcome {
            FetchOutcome::complete(Vec::new())
        }
    }

    #[test]
    fn registry_looks_up_by_platform() {
        let registry = AdapterRegistry::new()
            .with(Arc::new(Stub(Platform::G2)))
            .with(Arc::new(Stub(Platform::Reddit)));

        assert!(registry.get(Platform::Reddit).is_some());
        assert!(registry.get(Platform::Youtube).is_none());
        assert_eq!(registry.platforms(), vec![Platform::Reddit, Platform::G2]);
    }
}
