//! Redis event bus: outbound publisher and the inbound bridge.
//!
//! Status and config events go out through [`BusPublisher`] — an
//! unbounded queue drained by one task holding the Redis connection, so
//! publishers (including the status sink, which runs under the registry
//! row lock) never block. Inbound, [`run_bridge`] pattern-subscribes to
//! the meeting/transcript channels and routes each message into the
//! in-process hub; it is the single feed for local fan-out, which keeps
//! per-meeting delivery in publish order.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use uuid::Uuid;

use sb_domain::{Meeting, StatusTransition};
use sb_meetings::StatusSink;
use sb_protocol::{status_channel, BusChannel, ServerFrame, TranscriptPayload};

use crate::events::hub::EventHub;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound publisher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Non-blocking handle for publishing onto the bus.
#[derive(Clone)]
pub struct BusPublisher {
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl BusPublisher {
    /// A publisher plus the raw queue end, for tests and custom drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, channel: String, payload: String) {
        if self.tx.send(BusMessage { channel, payload }).is_err() {
            tracing::warn!("bus publisher task is gone; event dropped");
        }
    }
}

/// Spawn the drain task that PUBLISHes queued messages to Redis.
pub fn start_publisher(mut conn: ConnectionManager) -> BusPublisher {
    let (publisher, mut rx) = BusPublisher::channel();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let result: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                .arg(&msg.channel)
                .arg(&msg.payload)
                .query_async(&mut conn)
                .await;
            if let Err(e) = result {
                tracing::warn!(channel = %msg.channel, error = %e, "bus publish failed");
            }
        }
    });
    publisher
}

/// Status sink that serializes each updated record onto the bus. Local
/// subscribers receive it back through the bridge.
pub struct RedisStatusSink {
    publisher: BusPublisher,
}

impl RedisStatusSink {
    pub fn new(publisher: BusPublisher) -> Self {
        Self { publisher }
    }
}

impl StatusSink for RedisStatusSink {
    fn publish(&self, meeting: &Meeting, _transition: &StatusTransition) {
        match serde_json::to_string(meeting) {
            Ok(payload) => self
                .publisher
                .publish(status_channel(meeting.meeting_id), payload),
            Err(e) => tracing::error!(error = %e, "status event serialization failed"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turn one bus message into a subscriber frame. Config channels are for
/// bots, not subscribers, and route nowhere.
pub(crate) fn route_frame(channel: &str, payload: &str) -> Option<(Uuid, ServerFrame)> {
    match BusChannel::parse(channel)? {
        BusChannel::Status(id) => {
            let meeting: Meeting = serde_json::from_str(payload).ok()?;
            Some((id, ServerFrame::MeetingStatus { payload: meeting }))
        }
        BusChannel::TranscriptMutable(id) => {
            let payload: TranscriptPayload = serde_json::from_str(payload).ok()?;
            Some((id, ServerFrame::TranscriptMutable { payload }))
        }
        BusChannel::TranscriptFinalized(id) => {
            let payload: TranscriptPayload = serde_json::from_str(payload).ok()?;
            Some((id, ServerFrame::TranscriptFinalized { payload }))
        }
        BusChannel::Config(_) => None,
    }
}

const BRIDGE_PATTERNS: [&str; 3] = [
    "meeting.status.*",
    "transcript.mutable.*",
    "transcript.finalized.*",
];

/// Consume the bus and feed the hub. Reconnects with a fixed pause on
/// any connection failure.
pub async fn run_bridge(client: redis::Client, hub: Arc<EventHub>) {
    loop {
        match bridge_once(&client, &hub).await {
            Ok(()) => tracing::warn!("bus subscription stream ended; reconnecting"),
            Err(e) => tracing::warn!(error = %e, "bus subscription failed; reconnecting"),
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn bridge_once(client: &redis::Client, hub: &Arc<EventHub>) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    for pattern in BRIDGE_PATTERNS {
        pubsub.psubscribe(pattern).await?;
    }
    tracing::info!(patterns = ?BRIDGE_PATTERNS, "event bridge subscribed");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(channel = %channel, error = %e, "non-text bus payload ignored");
                continue;
            }
        };
        match route_frame(&channel, &payload) {
            Some((meeting_id, frame)) => hub.publish(meeting_id, frame),
            None => tracing::debug!(channel = %channel, "unroutable bus message ignored"),
        }
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
