//! Wire types shared by the control plane, bot containers, and subscribers.
//!
//! Three surfaces speak these types:
//! 1. Subscribers connect to `/ws`, send [`ClientFrame`]s and receive
//!    [`ServerFrame`]s.
//! 2. Bot containers POST [`BotStatusChange`] reports to
//!    `/internal/status_change` and request workers through
//!    [`AllocateRequest`] / [`FailoverRequest`].
//! 3. Bus channels (`meeting.status.<id>`, `transcript.*.<id>`) carry the
//!    payloads that [`BusChannel`] names and routes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sb_domain::{CompletionReason, FailureStage, Meeting};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriber frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Subscriber → control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { meeting_id: Uuid },
    Unsubscribe { meeting_id: Uuid },
}

/// Control plane → subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Full meeting record, sent on every status transition.
    #[serde(rename = "meeting.status")]
    MeetingStatus { payload: Meeting },

    /// In-progress transcript segments (may be revised).
    #[serde(rename = "transcript.mutable")]
    TranscriptMutable { payload: TranscriptPayload },

    /// Final transcript segments.
    #[serde(rename = "transcript.finalized")]
    TranscriptFinalized { payload: TranscriptPayload },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    /// Degraded-delivery notice (currently only `code: "slow"` after the
    /// subscriber's queue overflowed and oldest frames were dropped).
    #[serde(rename = "warning")]
    Warning { code: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptPayload {
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end_time: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bot callbacks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One status report from a bot container.
///
/// A payload carrying `exit_code` is an exit report; anything else is a
/// startup/progress report whose `status` field hints the lifecycle stage
/// (`joining`, `awaiting_admission`, `active`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStatusChange {
    /// The meeting this bot was launched for.
    pub connection_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    /// Pre-mapped terminal metadata; when absent the control plane
    /// derives it from `reason` and `exit_code`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<CompletionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    pub timestamp: DateTime<Utc>,
}

impl BotStatusChange {
    pub fn is_exit(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Control plane → bot answer to a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BotDirective {
    /// Carry on.
    Ack,
    /// The meeting is already terminal (user stop won); leave and exit.
    LeaveNow,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker allocation (bot-facing protocol)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub connection_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverRequest {
    pub connection_id: Uuid,
    /// The worker the bot observed failing.
    pub worker_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub worker_url: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus channels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const STATUS_PREFIX: &str = "meeting.status.";
pub const CONFIG_PREFIX: &str = "meeting.config.";
pub const TRANSCRIPT_MUTABLE_PREFIX: &str = "transcript.mutable.";
pub const TRANSCRIPT_FINALIZED_PREFIX: &str = "transcript.finalized.";

pub fn status_channel(meeting_id: Uuid) -> String {
    format!("{STATUS_PREFIX}{meeting_id}")
}

pub fn config_channel(meeting_id: Uuid) -> String {
    format!("{CONFIG_PREFIX}{meeting_id}")
}

pub fn transcript_mutable_channel(meeting_id: Uuid) -> String {
    format!("{TRANSCRIPT_MUTABLE_PREFIX}{meeting_id}")
}

pub fn transcript_finalized_channel(meeting_id: Uuid) -> String {
    format!("{TRANSCRIPT_FINALIZED_PREFIX}{meeting_id}")
}

/// A parsed bus channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusChannel {
    Status(Uuid),
    Config(Uuid),
    TranscriptMutable(Uuid),
    TranscriptFinalized(Uuid),
}

impl BusChannel {
    pub fn parse(channel: &str) -> Option<Self> {
        let (ctor, rest): (fn(Uuid) -> Self, &str) =
            if let Some(rest) = channel.strip_prefix(STATUS_PREFIX) {
                (Self::Status, rest)
            } else if let Some(rest) = channel.strip_prefix(CONFIG_PREFIX) {
                (Self::Config, rest)
            } else if let Some(rest) = channel.strip_prefix(TRANSCRIPT_MUTABLE_PREFIX) {
                (Self::TranscriptMutable, rest)
            } else if let Some(rest) = channel.strip_prefix(TRANSCRIPT_FINALIZED_PREFIX) {
                (Self::TranscriptFinalized, rest)
            } else {
                return None;
            };
        rest.parse::<Uuid>().ok().map(ctor)
    }

    pub fn meeting_id(self) -> Uuid {
        match self {
            Self::Status(id)
            | Self::Config(id)
            | Self::TranscriptMutable(id)
            | Self::TranscriptFinalized(id) => id,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
