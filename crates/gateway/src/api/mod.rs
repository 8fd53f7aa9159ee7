pub mod auth;
pub mod bots;
pub mod callbacks;
pub mod health;
pub mod transcripts;

use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Three surfaces:
/// - **public** — health probe, no auth.
/// - **owner** — bot lifecycle, transcripts, and the subscriber WS; the
///   [`auth::Owner`] extractor resolves and enforces the API key.
/// - **internal** — bot callbacks and worker allocation, guarded by
///   per-meeting bot tokens inside the handlers.
pub fn router() -> Router<AppState> {
    let public = Router::new().route("/v1/health", get(health::health));

    let owner = Router::new()
        // Bot lifecycle
        .route("/bots", post(bots::request_bot))
        .route("/bots", get(bots::list_bots))
        .route("/bots/status", get(bots::list_bots_status))
        .route(
            "/bots/:platform/:native_meeting_id",
            delete(bots::stop_bot),
        )
        .route(
            "/bots/:platform/:native_meeting_id/config",
            put(bots::update_config),
        )
        // Transcripts (proxied to the transcript store)
        .route(
            "/transcripts/:platform/:native_meeting_id",
            get(transcripts::get_transcript),
        )
        // Live event stream
        .route("/ws", get(crate::events::ws::subscriber_ws));

    let internal = Router::new()
        .route("/internal/status_change", post(callbacks::status_change))
        .route("/internal/allocate", post(callbacks::allocate))
        .route(
            "/internal/allocate/failover",
            post(callbacks::allocate_failover),
        );

    public
        .merge(owner)
        .merge(internal)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
