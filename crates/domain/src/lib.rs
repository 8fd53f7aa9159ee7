//! Core domain types for the Stenobot control plane: meeting records, the
//! status graph, bot exit-reason mapping, configuration, and the shared
//! error type.

pub mod config;
pub mod error;
pub mod meeting;
pub mod reason;

pub use error::{Error, Result};
pub use meeting::{
    BotConfig, CompletionReason, FailureStage, Meeting, MeetingData, MeetingStatus, Platform,
    StatusSource, StatusTransition, TranscriptionTask, TransitionDetail,
};
pub use reason::{map_exit_reason, ExitDisposition};
