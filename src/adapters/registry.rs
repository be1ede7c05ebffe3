//! Source registry
//!
//! Maps each account category to its [`AccountSource`]. The registry is built
//! once at startup and injected into the sync orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use super::{AccountSource, AdvertisingSource, AmcSource, DspSource};
use crate::ads_api::AdsApi;
use crate::config::SyncConfig;
use crate::models::AccountCategory;
use crate::rate_limit::RateLimitedExecutor;

#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<AccountCategory, Arc<dyn AccountSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three Amazon Ads sources sharing one executor.
    pub fn amazon(
        api: Arc<dyn AdsApi>,
        executor: Arc<RateLimitedExecutor>,
        config: &SyncConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AdvertisingSource::new(
            api.clone(),
            executor.clone(),
            config.advertising_page_size,
        )));
        registry.register(Arc::new(DspSource::new(api.clone(), executor.clone())));
        registry.register(Arc::new(AmcSource::new(api, executor)));
        registry
    }

    /// Register a source, replacing any previous one for its category.
    pub fn register(&mut self, source: Arc<dyn AccountSource>) {
        self.sources.insert(source.category(), source);
    }

    pub fn get(&self, category: AccountCategory) -> Option<Arc<dyn AccountSource>> {
        self.sources.get(&category).cloned()
    }

    pub fn categories(&self) -> Vec<AccountCategory> {
        let mut categories: Vec<_> = self.sources.keys().copied().collect();
        categories.sort();
        categories
    }
}
