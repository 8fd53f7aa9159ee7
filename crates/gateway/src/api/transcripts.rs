//! Transcript read endpoint — a thin proxy over the external transcript
//! store (the control plane never persists transcripts itself).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use sb_domain::Platform;

use crate::api::auth::Owner;
use crate::error::ControlError;
use crate::state::AppState;

/// GET /transcripts/:platform/:native_meeting_id
pub async fn get_transcript(
    State(state): State<AppState>,
    Owner(owner_id): Owner,
    Path((platform, native_meeting_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ControlError> {
    let platform: Platform = platform.parse().map_err(ControlError::BadRequest)?;

    // The caller must own a meeting (live or finished) at these
    // coordinates before we reach out to the store.
    let meeting = state
        .meetings
        .find_latest_by_native(&owner_id, platform, &native_meeting_id)
        .ok_or(ControlError::NotFound)?;

    let Some(base) = state.config.transcripts.base_url.as_deref() else {
        return Err(ControlError::Unavailable(
            "transcript store not configured".into(),
        ));
    };

    let url = format!(
        "{}/transcripts/{}/{}",
        base.trim_end_matches('/'),
        platform,
        native_meeting_id
    );
    let response = state
        .http
        .get(&url)
        .query(&[("meeting_id", meeting.meeting_id.to_string())])
        .send()
        .await
        .map_err(|e| ControlError::Unavailable(format!("transcript store unreachable: {e}")))?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ControlError::Internal(format!("transcript store payload: {e}")))?;

    Ok((status, Json(body)))
}
