//! The status machine — the only path that mutates a meeting's status.
//!
//! Source priority: user intent via the API is absolute (an api-requested
//! terminal state always wins over any non-terminal state), bot callbacks
//! follow the forward-only graph, and the watchdog may only fail a
//! non-terminal meeting. Timing guards for the watchdog (was the bot heard
//! from recently?) are the supervisor's, not the store's.

use uuid::Uuid;

use chrono::Utc;
use sb_domain::{Meeting, MeetingStatus, StatusSource, StatusTransition, TransitionDetail};

use crate::store::MeetingStore;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    #[error("meeting not found")]
    NotFound,

    #[error("invalid transition {from} -> {to}")]
    Invalid {
        from: MeetingStatus,
        to: MeetingStatus,
    },
}

impl MeetingStore {
    /// Apply one status transition under the meeting's row lock.
    ///
    /// On success the updated row is persisted, the transition record is
    /// appended to the data envelope, and the status sink observes the
    /// event before the lock is released (so sink order equals commit
    /// order per meeting).
    pub fn transition(
        &self,
        meeting_id: &Uuid,
        to: MeetingStatus,
        source: StatusSource,
        detail: TransitionDetail,
    ) -> Result<Meeting, TransitionError> {
        let mut inner = self.inner.write();
        let meeting = inner
            .meetings
            .get_mut(meeting_id)
            .ok_or(TransitionError::NotFound)?;
        let from = meeting.status;

        let allowed = match source {
            // User stop is absolute: any non-terminal state yields.
            StatusSource::Api if to.is_terminal() => !from.is_terminal(),
            // The watchdog only ever declares failure.
            StatusSource::Watchdog => to == MeetingStatus::Failed && !from.is_terminal(),
            _ => from.can_transition(to),
        };
        if !allowed {
            return Err(TransitionError::Invalid { from, to });
        }

        let now = Utc::now();
        meeting.status = to;
        if to == MeetingStatus::Active && meeting.started_at.is_none() {
            meeting.started_at = Some(now);
        }
        if to.is_terminal() {
            meeting.ended_at = Some(now);
        }

        if let Some(container_id) = detail.container_id {
            meeting.container_id = Some(container_id);
        }
        if let Some(reason) = detail.completion_reason {
            meeting.data.completion_reason = Some(reason);
        }
        if let Some(stage) = detail.failure_stage {
            meeting.data.failure_stage = Some(stage);
        }
        if let Some(details) = detail.error_details {
            meeting.data.error_details = Some(details);
        }

        let transition = StatusTransition {
            from,
            to,
            timestamp: now,
            source,
        };
        meeting.data.transitions.push(transition.clone());

        let snapshot = meeting.clone();
        self.persist(&snapshot);
        self.sink.publish(&snapshot, &transition);

        tracing::info!(
            meeting_id = %meeting_id,
            from = %from,
            to = %to,
            source = ?source,
            "meeting status transition"
        );
        Ok(snapshot)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
