// Library root - exports for the binary and integration tests

pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use background::PollerStatus;
use middleware::{api_key_middleware, rate_limit_middleware, request_log_middleware, ApiKeyGuard, RateLimiter};
use services::EventStore;

/// Everything the read API needs. Handlers only ever read from the store.
#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
    pub poller: PollerStatus,
    /// Upstream endpoint, shown on `/health`.
    pub source: Arc<str>,
    /// Durable backend name, `none` when disabled.
    pub persistence: &'static str,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let api = &state.config.api;
    let auth = axum::middleware::from_fn_with_state(ApiKeyGuard::from_config(api), api_key_middleware);
    let health_limiter = RateLimiter::from_config(api, api.health_rate_limit_max_requests);
    let events_limiter = RateLimiter::from_config(api, api.rate_limit_max_requests);

    // Each group has its own budget; the limiter runs before the key check.
    let health = Router::new()
        .route("/health", get(handlers::health_check))
        .route_layer(auth.clone())
        .route_layer(axum::middleware::from_fn_with_state(health_limiter, rate_limit_middleware));
    let events = Router::new()
        .route("/v16", get(handlers::list_events))
        .route("/v16/:id", get(handlers::get_event))
        .route_layer(auth)
        .route_layer(axum::middleware::from_fn_with_state(events_limiter, rate_limit_middleware));

    Router::new()
        .merge(health)
        .merge(events)
        .layer(axum::middleware::from_fn(request_log_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
