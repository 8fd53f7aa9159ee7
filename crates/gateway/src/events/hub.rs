//! In-process fan-out hub: one broadcast channel per meeting.
//!
//! Channels are created lazily by the first subscriber and pruned once
//! the last receiver is gone. Publishing to a meeting nobody watches is
//! free. The channel capacity bounds each subscriber's backlog: a slow
//! receiver observes a `Lagged` error (oldest frames dropped), which the
//! WS layer turns into a `warning: slow` frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use sb_protocol::ServerFrame;

pub struct EventHub {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<ServerFrame>>>,
    depth: usize,
}

impl EventHub {
    pub fn new(depth: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            depth: depth.max(1),
        }
    }

    /// Join a meeting's stream; delivery starts from "now" (no replay).
    pub fn subscribe(&self, meeting_id: Uuid) -> broadcast::Receiver<ServerFrame> {
        let mut channels = self.channels.write();
        channels
            .entry(meeting_id)
            .or_insert_with(|| broadcast::channel(self.depth).0)
            .subscribe()
    }

    /// Deliver a frame to the meeting's subscribers, if any.
    pub fn publish(&self, meeting_id: Uuid, frame: ServerFrame) {
        let channels = self.channels.read();
        if let Some(tx) = channels.get(&meeting_id) {
            // Err just means no receiver is currently attached.
            let _ = tx.send(frame);
        }
    }

    /// Drop channels whose subscribers are all gone.
    pub fn prune_idle(&self) {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let pruned = before - channels.len();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = channels.len(), "pruned idle meeting channels");
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

/// Background loop clearing abandoned channels.
pub async fn run_pruner(hub: Arc<EventHub>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        hub.prune_idle();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
