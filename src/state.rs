use std::sync::Arc;

use crate::{
    cache::{CacheConfig, ResponseCache},
    config::DebateSettings,
    dispatcher::RoundDispatcher,
    metrics::AppMetrics,
    multiplexer::StreamMultiplexer,
    registry::BackendRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BackendRegistry>,
    pub dispatcher: Arc<RoundDispatcher>,
    pub multiplexer: Arc<StreamMultiplexer>,
    pub metrics: Arc<AppMetrics>,
}

impl AppState {
    pub fn new(
        registry: Arc<BackendRegistry>,
        cache: Arc<ResponseCache>,
        settings: DebateSettings,
    ) -> Self {
        let metrics = Arc::new(AppMetrics::new());
        Self {
            dispatcher: Arc::new(RoundDispatcher::new(
                registry.clone(),
                cache,
                settings.clone(),
                metrics.clone(),
            )),
            multiplexer: Arc::new(StreamMultiplexer::new(
                registry.clone(),
                settings,
                metrics.clone(),
            )),
            registry,
            metrics,
        }
    }

    pub fn new_for_tests(registry: BackendRegistry) -> Self {
        Self::new(
            Arc::new(registry),
            Arc::new(ResponseCache::memory(CacheConfig::default())),
            DebateSettings::default(),
        )
    }
}
