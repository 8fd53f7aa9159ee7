//! Mapping from bot exit reports to control-plane terminal metadata.
//!
//! Bots report a free-form `reason` string plus an exit code. A zero exit
//! code maps to a `COMPLETED` meeting with a `completion_reason`; anything
//! else maps to `FAILED` with a `failure_stage` locating the break.

use crate::meeting::{CompletionReason, FailureStage};

/// What an exit report resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Completed(CompletionReason),
    Failed(FailureStage),
}

/// Resolve a bot exit report. Unknown reasons fall back to `stopped` on
/// success and stage `active` on failure.
pub fn map_exit_reason(reason: &str, exit_code: i64) -> ExitDisposition {
    if exit_code == 0 {
        let reason = match reason {
            "self_initiated_leave" | "stopped" => CompletionReason::Stopped,
            "admission_failed" => CompletionReason::AwaitingAdmissionTimeout,
            "left_alone" => CompletionReason::LeftAlone,
            "evicted" => CompletionReason::Evicted,
            "removed_by_admin" => CompletionReason::RemovedByAdmin,
            "admission_rejected_by_admin" => CompletionReason::AdmissionRejectedByAdmin,
            _ => CompletionReason::Stopped,
        };
        return ExitDisposition::Completed(reason);
    }

    let stage = match reason {
        "teams_error" | "google_meet_error" | "post_join_setup_error" => FailureStage::Joining,
        "missing_meeting_url" | "validation_error" => FailureStage::Requested,
        // Platform-specific joining errors follow a `joining_*_error` shape.
        r if r.starts_with("joining_") && r.ends_with("_error") => FailureStage::Joining,
        _ => FailureStage::Active,
    };
    ExitDisposition::Failed(stage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_maps_to_completion_reasons() {
        assert_eq!(
            map_exit_reason("self_initiated_leave", 0),
            ExitDisposition::Completed(CompletionReason::Stopped)
        );
        assert_eq!(
            map_exit_reason("admission_failed", 0),
            ExitDisposition::Completed(CompletionReason::AwaitingAdmissionTimeout)
        );
        assert_eq!(
            map_exit_reason("left_alone", 0),
            ExitDisposition::Completed(CompletionReason::LeftAlone)
        );
        assert_eq!(
            map_exit_reason("evicted", 0),
            ExitDisposition::Completed(CompletionReason::Evicted)
        );
        assert_eq!(
            map_exit_reason("removed_by_admin", 0),
            ExitDisposition::Completed(CompletionReason::RemovedByAdmin)
        );
        assert_eq!(
            map_exit_reason("admission_rejected_by_admin", 0),
            ExitDisposition::Completed(CompletionReason::AdmissionRejectedByAdmin)
        );
    }

    #[test]
    fn unknown_reason_with_zero_exit_defaults_to_stopped() {
        assert_eq!(
            map_exit_reason("some_future_reason", 0),
            ExitDisposition::Completed(CompletionReason::Stopped)
        );
    }

    #[test]
    fn nonzero_exit_maps_to_failure_stages() {
        assert_eq!(
            map_exit_reason("teams_error", 1),
            ExitDisposition::Failed(FailureStage::Joining)
        );
        assert_eq!(
            map_exit_reason("google_meet_error", 2),
            ExitDisposition::Failed(FailureStage::Joining)
        );
        assert_eq!(
            map_exit_reason("post_join_setup_error", 1),
            ExitDisposition::Failed(FailureStage::Joining)
        );
        assert_eq!(
            map_exit_reason("missing_meeting_url", 1),
            ExitDisposition::Failed(FailureStage::Requested)
        );
        assert_eq!(
            map_exit_reason("validation_error", 1),
            ExitDisposition::Failed(FailureStage::Requested)
        );
    }

    #[test]
    fn joining_prefixed_errors_map_to_joining() {
        assert_eq!(
            map_exit_reason("joining_captcha_error", 1),
            ExitDisposition::Failed(FailureStage::Joining)
        );
    }

    #[test]
    fn unknown_reason_with_nonzero_exit_defaults_to_active() {
        assert_eq!(
            map_exit_reason("heap_exhausted", 137),
            ExitDisposition::Failed(FailureStage::Active)
        );
        // A completion-shaped reason on a failing exit still fails.
        assert_eq!(
            map_exit_reason("self_initiated_leave", 1),
            ExitDisposition::Failed(FailureStage::Active)
        );
    }
}
