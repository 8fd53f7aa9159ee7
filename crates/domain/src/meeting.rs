//! Meeting records and the status graph.
//!
//! A meeting is one request to attend a real-world conference; internally
//! keyed by `meeting_id`, externally by `(owner, platform, native_meeting_id)`.
//! Status moves strictly forward along
//! `REQUESTED < JOINING < AWAITING_ADMISSION < ACTIVE`, with `COMPLETED` and
//! `FAILED` reachable from any non-terminal state. Terminal states are
//! immutable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Platform
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    GoogleMeet,
    Teams,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleMeet => "google_meet",
            Self::Teams => "teams",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google_meet" => Ok(Self::GoogleMeet),
            "teams" => Ok(Self::Teams),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Meeting lifecycle status.
///
/// The legacy `stopping` value (pre terminal-only model) deserializes as
/// `Requested` — a stop already in flight toward `COMPLETED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeetingStatus {
    #[serde(alias = "stopping", alias = "STOPPING")]
    Requested,
    Joining,
    AwaitingAdmission,
    Active,
    Completed,
    Failed,
}

impl MeetingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the forward progression. Terminal states share the
    /// highest rank; they are unreachable as transition sources anyway.
    fn rank(self) -> u8 {
        match self {
            Self::Requested => 0,
            Self::Joining => 1,
            Self::AwaitingAdmission => 2,
            Self::Active => 3,
            Self::Completed | Self::Failed => 4,
        }
    }

    /// Whether the graph permits `self → to`.
    ///
    /// Terminal sources never transition. Terminal targets are reachable
    /// from every non-terminal state; non-terminal targets must move the
    /// meeting strictly forward (which also makes duplicate startup
    /// callbacks a rejected `ACTIVE → ACTIVE` edge).
    pub fn can_transition(self, to: MeetingStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to.is_terminal() || to.rank() > self.rank()
    }
}

impl std::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "REQUESTED",
            Self::Joining => "JOINING",
            Self::AwaitingAdmission => "AWAITING_ADMISSION",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Who asked for a status transition. User intent via the API outranks bot
/// self-reports, which outrank the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Api,
    BotCallback,
    Watchdog,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal metadata
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Machine-readable reason a meeting ended in `COMPLETED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Stopped,
    AwaitingAdmissionTimeout,
    LeftAlone,
    Evicted,
    RemovedByAdmin,
    AdmissionRejectedByAdmin,
}

/// Which lifecycle stage a `FAILED` meeting broke in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Requested,
    Joining,
    Active,
}

impl FailureStage {
    /// Stage corresponding to a meeting's current status, used when a
    /// failure is observed from outside the bot (launch errors, watchdog).
    pub fn from_status(status: MeetingStatus) -> Self {
        match status {
            MeetingStatus::Requested => Self::Requested,
            MeetingStatus::Joining | MeetingStatus::AwaitingAdmission => Self::Joining,
            _ => Self::Active,
        }
    }
}

/// One recorded transition, appended to the meeting's data envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: MeetingStatus,
    pub to: MeetingStatus,
    pub timestamp: DateTime<Utc>,
    pub source: StatusSource,
}

/// Optional metadata carried by a transition request.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    pub completion_reason: Option<CompletionReason>,
    pub failure_stage: Option<FailureStage>,
    pub error_details: Option<String>,
    /// Set by the bot's startup handshake.
    pub container_id: Option<String>,
}

impl TransitionDetail {
    pub fn completed(reason: CompletionReason) -> Self {
        Self {
            completion_reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn failed(stage: FailureStage, error_details: impl Into<String>) -> Self {
        Self {
            failure_stage: Some(stage),
            error_details: Some(error_details.into()),
            ..Default::default()
        }
    }
}

/// Semi-structured envelope accumulated over the meeting's life.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeetingData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<CompletionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_stage: Option<FailureStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    /// Every observed transition, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<StatusTransition>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bot config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionTask {
    #[default]
    Transcribe,
    Translate,
}

/// Per-meeting bot configuration. Unknown keys are rejected at the API
/// boundary (`deny_unknown_fields` on the request body).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotConfig {
    /// ISO-639-1 code or `"auto"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub task: TranscriptionTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl BotConfig {
    /// Input validation for the config fields; the error names the field.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(lang) = &self.language {
            let iso_639_1 = lang.len() == 2 && lang.chars().all(|c| c.is_ascii_lowercase());
            if lang != "auto" && !iso_639_1 {
                return Err(format!("language: expected ISO-639-1 code or \"auto\", got {lang:?}"));
            }
        }
        if let Some(name) = &self.bot_name {
            if name.trim().is_empty() || name.len() > 128 {
                return Err("bot_name: must be 1-128 characters".into());
            }
        }
        if let Some(url) = &self.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("webhook_url: not an http(s) URL: {url:?}"));
            }
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Meeting record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The authoritative meeting record (one row per attendance request).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub meeting_id: Uuid,
    pub owner_id: String,
    pub platform: Platform,
    /// User-supplied conference identifier; never generated.
    pub native_meeting_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passcode: Option<String>,

    pub status: MeetingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Set by the bot's startup handshake; retained after terminal for audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Transcription worker assigned through the allocator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_url: Option<String>,

    pub config: BotConfig,
    #[serde(default)]
    pub data: MeetingData,
}

impl Meeting {
    pub fn new(
        owner_id: impl Into<String>,
        platform: Platform,
        native_meeting_id: impl Into<String>,
        passcode: Option<String>,
        config: BotConfig,
    ) -> Self {
        Self {
            meeting_id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            platform,
            native_meeting_id: native_meeting_id.into(),
            passcode,
            status: MeetingStatus::Requested,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            container_id: None,
            worker_url: None,
            config,
            data: MeetingData::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
