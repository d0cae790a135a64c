pub mod backend;
pub mod cache;
pub mod coalescing;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod multiplexer;
pub mod registry;
pub mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use cache::{CacheConfig, ResponseCache};
use config::{ConfigSource, DebateSettings, ProcessEnv};
use registry::BackendRegistry;
use tracing::info;

pub fn build_state() -> Result<state::AppState, std::io::Error> {
    let config: Arc<dyn ConfigSource> = Arc::new(ProcessEnv);
    let settings = DebateSettings::from_source(config.as_ref());
    let registry = BackendRegistry::with_default_providers(config.clone(), &settings)
        .map_err(std::io::Error::other)?;
    let cache = ResponseCache::from_source(CacheConfig::from_source(config.as_ref()), config.as_ref());

    let configured = registry
        .active_backends()
        .iter()
        .map(|backend| backend.id().to_owned())
        .collect::<Vec<_>>()
        .join(",");
    info!(
        backends = %configured,
        cache_ttl_secs = cache.ttl().as_secs(),
        max_tokens = settings.max_tokens,
        "debate backends configured"
    );

    Ok(state::AppState::new(
        Arc::new(registry),
        Arc::new(cache),
        settings,
    ))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/models", get(handlers::list_models))
        .route("/debate", post(handlers::debate))
        .route("/debate/stream", post(handlers::debate_stream))
        .with_state(state)
}
