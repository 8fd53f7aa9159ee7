//! Bot lifecycle API.
//!
//! - `POST   /bots`                                  — request a bot
//! - `GET    /bots`                                  — list live meetings
//! - `GET    /bots/status`                           — live meetings + container liveness
//! - `DELETE /bots/:platform/:native_meeting_id`     — stop the bot
//! - `PUT    /bots/:platform/:native_meeting_id/config` — change live config

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use sb_domain::{BotConfig, Platform, TranscriptionTask};

use crate::api::auth::Owner;
use crate::error::ControlError;
use crate::state::AppState;
use crate::supervisor::ConfigPatch;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Unknown fields are rejected outright: a typo'd option must not be
/// silently ignored for a bot that is about to join a real meeting.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateBotRequest {
    pub platform: Platform,
    pub native_meeting_id: String,
    #[serde(default)]
    pub passcode: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Option<TranscriptionTask>,
    #[serde(default)]
    pub bot_name: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateConfigRequest {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub task: Option<TranscriptionTask>,
}

fn parse_platform(raw: &str) -> Result<Platform, ControlError> {
    raw.parse::<Platform>().map_err(ControlError::BadRequest)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /bots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn request_bot(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Json(body): Json<CreateBotRequest>,
) -> Result<impl IntoResponse, ControlError> {
    let config = BotConfig {
        language: body.language,
        task: body.task.unwrap_or_default(),
        bot_name: body.bot_name,
        webhook_url: body.webhook_url,
    };

    let budget = Duration::from_secs(state.config.timing.request_timeout_secs);
    let meeting = tokio::time::timeout(
        budget,
        state.supervisor.request_bot(
            &owner_id,
            body.platform,
            &body.native_meeting_id,
            body.passcode,
            config,
        ),
    )
    .await
    .map_err(|_| ControlError::Unavailable("bot request timed out".into()))??;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "meeting_id": meeting.meeting_id,
            "status": meeting.status,
        })),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /bots/:platform/:native_meeting_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stop_bot(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path((platform, native_meeting_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ControlError> {
    let platform = parse_platform(&platform)?;
    let meeting = state
        .supervisor
        .stop_bot(&owner_id, platform, &native_meeting_id)
        .await?;

    // Accepted: the row is terminal; container teardown is asynchronous.
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "meeting_id": meeting.meeting_id })),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PUT /bots/:platform/:native_meeting_id/config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn update_config(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path((platform, native_meeting_id)): Path<(String, String)>,
    Json(body): Json<UpdateConfigRequest>,
) -> Result<impl IntoResponse, ControlError> {
    let platform = parse_platform(&platform)?;
    let meeting = state
        .supervisor
        .update_config(
            &owner_id,
            platform,
            &native_meeting_id,
            ConfigPatch {
                language: body.language,
                task: body.task,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "meeting_id": meeting.meeting_id,
            "config": meeting.config,
        })),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /bots, GET /bots/status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_bots(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
) -> impl IntoResponse {
    let meetings = state.meetings.list_active(&owner_id);
    Json(serde_json::json!({ "meetings": meetings }))
}

pub async fn list_bots_status(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
) -> impl IntoResponse {
    let rows: Vec<serde_json::Value> = state
        .supervisor
        .list_with_liveness(&owner_id)
        .await
        .into_iter()
        .map(|(meeting, running)| {
            serde_json::json!({
                "meeting": meeting,
                "container_running": running,
            })
        })
        .collect();
    Json(serde_json::json!({ "meetings": rows }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_rejects_unknown_fields() {
        let err = serde_json::from_str::<CreateBotRequest>(
            r#"{"platform":"google_meet","native_meeting_id":"abc","surprise":true}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("surprise"));
    }

    #[test]
    fn create_request_minimal_body() {
        let req: CreateBotRequest = serde_json::from_str(
            r#"{"platform":"teams","native_meeting_id":"xyz-123"}"#,
        )
        .unwrap();
        assert_eq!(req.platform, Platform::Teams);
        assert!(req.task.is_none());
        assert!(req.passcode.is_none());
    }

    #[test]
    fn update_request_accepts_partial_patch() {
        let req: UpdateConfigRequest =
            serde_json::from_str(r#"{"task":"translate"}"#).unwrap();
        assert_eq!(req.task, Some(TranscriptionTask::Translate));
        assert!(req.language.is_none());
    }

    #[test]
    fn platform_path_segment_parsing() {
        assert!(parse_platform("google_meet").is_ok());
        assert!(matches!(
            parse_platform("webex"),
            Err(ControlError::BadRequest(_))
        ));
    }
}
