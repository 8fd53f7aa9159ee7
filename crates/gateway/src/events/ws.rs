//! Subscriber WebSocket endpoint.
//!
//! Flow:
//! 1. Client connects to `/ws` with an API key (header or `api_key`
//!    query param); the key resolves to the owner before upgrade.
//! 2. Client sends `{"type":"subscribe","meeting_id":...}` for each
//!    meeting it wants; ownership is checked against the registry.
//! 3. Status and transcript frames stream until `unsubscribe` or
//!    disconnect. Slow consumers lose oldest frames and get a
//!    `{"type":"warning","code":"slow"}` notice.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use sb_protocol::{ClientFrame, ServerFrame};

use crate::api::auth::Owner;
use crate::state::AppState;

/// GET /ws — upgrade to the subscriber stream.
pub async fn subscriber_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Owner(owner_id): Owner,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, owner_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, owner_id: String) {
    let (ws_sink, mut ws_stream) = socket.split();
    let subscriber_id = Uuid::new_v4();

    tracing::info!(%subscriber_id, owner_id = %owner_id, "subscriber connected");

    // Outbound queue drained by a single writer task.
    let depth = state.config.limits.subscriber_queue_depth;
    let write_timeout = Duration::from_secs(state.config.timing.write_timeout_secs);
    let (out_tx, out_rx) = mpsc::channel::<ServerFrame>(depth);
    let writer = tokio::spawn(write_loop(ws_sink, out_rx, write_timeout));

    // Per-subscription forwarder tasks, keyed by meeting.
    let mut forwarders: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    read_loop(
        &mut ws_stream,
        &state,
        &owner_id,
        &out_tx,
        &mut forwarders,
    )
    .await;

    // Cleanup: cancel forwarders, then let the writer drain and stop.
    for (_, handle) in forwarders.drain() {
        handle.abort();
    }
    drop(out_tx);
    writer.abort();
    tracing::info!(%subscriber_id, "subscriber disconnected");
}

async fn read_loop(
    ws_stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    owner_id: &str,
    out_tx: &mpsc::Sender<ServerFrame>,
    forwarders: &mut HashMap<Uuid, JoinHandle<()>>,
) {
    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // axum answers WS-level pings automatically.
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                send_or_drop(
                    out_tx,
                    ServerFrame::Error {
                        code: "invalid_payload".into(),
                        message: "expected subscribe/unsubscribe frame".into(),
                    },
                );
                continue;
            }
        };

        match frame {
            ClientFrame::Subscribe { meeting_id } => {
                match authorize_subscription(state, owner_id, meeting_id) {
                    Ok(()) => {
                        forwarders.entry(meeting_id).or_insert_with(|| {
                            let rx = state.hub.subscribe(meeting_id);
                            tokio::spawn(forward_loop(rx, out_tx.clone()))
                        });
                        tracing::debug!(owner_id = %owner_id, %meeting_id, "subscribed");
                    }
                    Err(frame) => send_or_drop(out_tx, frame),
                }
            }
            ClientFrame::Unsubscribe { meeting_id } => {
                if let Some(handle) = forwarders.remove(&meeting_id) {
                    handle.abort();
                    tracing::debug!(owner_id = %owner_id, %meeting_id, "unsubscribed");
                }
            }
        }
    }
}

/// Ownership check: the meeting must exist and belong to the caller. The
/// failure is reported as an error frame; the connection stays up.
fn authorize_subscription(
    state: &AppState,
    owner_id: &str,
    meeting_id: Uuid,
) -> Result<(), ServerFrame> {
    match state.meetings.get(&meeting_id) {
        Some(meeting) if meeting.owner_id == owner_id => Ok(()),
        Some(_) => Err(ServerFrame::Error {
            code: "forbidden".into(),
            message: "meeting belongs to another owner".into(),
        }),
        None => Err(ServerFrame::Error {
            code: "not_found".into(),
            message: "unknown meeting".into(),
        }),
    }
}

/// Copy frames from a meeting's broadcast channel into the connection
/// queue, converting lag into a `slow` warning.
async fn forward_loop(
    mut rx: broadcast::Receiver<ServerFrame>,
    out_tx: mpsc::Sender<ServerFrame>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                tracing::debug!(dropped, "subscriber lagging; oldest frames dropped");
                if out_tx
                    .send(ServerFrame::Warning { code: "slow".into() })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Drain the connection queue onto the socket. A write that exceeds the
/// budget marks the connection sick and ends the task.
async fn write_loop(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerFrame>,
    write_timeout: Duration,
) {
    while let Some(frame) = out_rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "outbound frame serialization failed");
                continue;
            }
        };
        match tokio::time::timeout(write_timeout, ws_sink.send(Message::Text(json))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                tracing::warn!("subscriber write timed out; dropping connection");
                break;
            }
        }
    }
}

/// Queue a frame for the subscriber; silently dropped if the writer is
/// saturated (the frames at stake here are error notices).
fn send_or_drop(out_tx: &mpsc::Sender<ServerFrame>, frame: ServerFrame) {
    let _ = out_tx.try_send(frame);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
