use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;

use crate::models::{Event, EventFilter, EventId, EventStatus};
use crate::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Debug, Default, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<String>,
}

impl ListEventsQuery {
    fn filter(&self) -> Result<EventFilter, ApiError> {
        match self.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(EventFilter::default()),
            Some(text) => text.parse::<EventStatus>().map(EventFilter::status).map_err(|_| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": format!("Unknown status '{}', expected active or lost", text)})),
                )
            }),
        }
    }
}

// The upstream record stays in the store either way
fn present(mut event: Event, include_raw: bool) -> Event {
    if !include_raw {
        event.raw = None;
    }
    event
}

/// Tracked events, most recently seen first.
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let filter = query.filter()?;
    let include_raw = state.config.api.include_raw;
    let events = state.store.list(filter).await;
    Ok(Json(events.into_iter().map(|e| present(e, include_raw)).collect()))
}

pub async fn get_event(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Event>, ApiError> {
    match state.store.get(&EventId::new(id)).await {
        Some(event) => Ok(Json(present(event, state.config.api.include_raw))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Event not found"})),
        )),
    }
}
