//! Health probe: process uptime, dependency round-trips, and meeting
//! counts by status.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;

use crate::state::AppState;

/// GET /v1/health (public).
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds()
        .max(0);

    let registry = match state.supervisor.pool().ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };
    let docker = match state.supervisor.runtime().ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };

    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "meetings": state.meetings.status_counts(),
        "subscribed_meetings": state.hub.channel_count(),
        "registry": registry,
        "docker": docker,
    }))
}
