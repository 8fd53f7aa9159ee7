//! Internal bot-facing surface, authenticated by the per-meeting bot
//! token minted at launch.
//!
//! - `POST /internal/status_change`      — startup/progress/exit reports
//! - `POST /internal/allocate`           — request a transcription worker
//! - `POST /internal/allocate/failover`  — replace an unhealthy worker

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;

use sb_protocol::{AllocateRequest, AllocateResponse, BotStatusChange, FailoverRequest};

use crate::api::auth::bot_token_from_headers;
use crate::error::ControlError;
use crate::state::AppState;

fn require_token(headers: &HeaderMap) -> Result<String, ControlError> {
    bot_token_from_headers(headers).ok_or(ControlError::AuthRequired)
}

pub async fn status_change(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(report): Json<BotStatusChange>,
) -> Result<impl IntoResponse, ControlError> {
    let token = require_token(&headers)?;
    let directive = state
        .supervisor
        .handle_status_change(&token, report)
        .await?;
    Ok(Json(directive))
}

pub async fn allocate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AllocateRequest>,
) -> Result<impl IntoResponse, ControlError> {
    let token = require_token(&headers)?;
    let worker_url = state
        .supervisor
        .allocate_worker(&token, body.connection_id)
        .await?;
    Ok(Json(AllocateResponse { worker_url }))
}

pub async fn allocate_failover(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<FailoverRequest>,
) -> Result<impl IntoResponse, ControlError> {
    let token = require_token(&headers)?;
    let worker_url = state
        .supervisor
        .failover_worker(&token, body.connection_id, &body.worker_url)
        .await?;
    Ok(Json(AllocateResponse { worker_url }))
}
