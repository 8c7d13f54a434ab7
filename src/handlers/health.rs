use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::background::PollerHealth;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` while the poller is failing. Reads keep working either way.
    pub status: &'static str,
    pub events_cached: usize,
    pub source: String,
    pub persistence: &'static str,
    pub poller: PollerView,
}

#[derive(Debug, Serialize)]
pub struct PollerView {
    pub running: bool,
    #[serde(flatten)]
    pub health: PollerHealth,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let health = state.poller.snapshot().await;
    Json(HealthResponse {
        status: if health.degraded() { "degraded" } else { "ok" },
        events_cached: state.store.len().await,
        source: state.source.to_string(),
        persistence: state.persistence,
        poller: PollerView {
            running: health.running(),
            health,
        },
    })
}
