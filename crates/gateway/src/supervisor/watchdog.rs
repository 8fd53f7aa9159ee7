//! Container watchdog: catches bots that died without an exit callback.
//!
//! Every sweep inspects the container behind each non-terminal meeting.
//! A container that is gone — and whose bot has not been heard from
//! within the callback grace period — means the meeting failed without
//! telling us; the watchdog records the failure and runs the post-meeting
//! routine so the worker slot is not leaked.

use std::time::Duration;

use chrono::{DateTime, Utc};

use sb_domain::{FailureStage, MeetingStatus, StatusSource, TransitionDetail};

use super::{container_name, BotRuntime, Supervisor};

/// The sweep decision, kept pure for testing: fail only when the
/// container is gone and the grace period since the bot was last heard
/// from has fully elapsed.
pub(crate) fn should_fail(
    now: DateTime<Utc>,
    last_heard: DateTime<Utc>,
    container_running: bool,
    grace: Duration,
) -> bool {
    if container_running {
        return false;
    }
    let elapsed = now.signed_duration_since(last_heard);
    elapsed.num_milliseconds() >= grace.as_millis() as i64
}

impl Supervisor {
    /// One watchdog pass over every non-terminal meeting.
    pub async fn watchdog_sweep(&self) {
        let grace = Duration::from_secs(self.config.timing.callback_grace_secs);
        let now = Utc::now();

        for meeting in self.meetings.list_non_terminal() {
            let meeting_id = meeting.meeting_id;

            // Meetings adopted after a restart may have no runtime entry.
            let (name, last_heard) = {
                let mut bots = self.bots.write();
                let rt = bots.entry(meeting_id).or_insert_with(|| BotRuntime {
                    container_name: container_name(&meeting_id),
                    launched_at: meeting.created_at,
                    last_callback_at: None,
                    allocation: meeting.worker_url.clone(),
                    finalized: false,
                });
                (
                    rt.container_name.clone(),
                    rt.last_callback_at.unwrap_or(rt.launched_at),
                )
            };

            let running = match self.runtime.is_running(&name).await {
                Ok(running) => running,
                Err(e) => {
                    tracing::warn!(%meeting_id, error = %e, "container inspect failed, skipping");
                    continue;
                }
            };

            if !should_fail(now, last_heard, running, grace) {
                continue;
            }

            tracing::warn!(
                %meeting_id,
                container = %name,
                status = %meeting.status,
                "container vanished without exit callback"
            );
            let result = self.meetings.transition(
                &meeting_id,
                MeetingStatus::Failed,
                StatusSource::Watchdog,
                TransitionDetail {
                    failure_stage: Some(FailureStage::from_status(meeting.status)),
                    error_details: Some("container_vanished".into()),
                    ..Default::default()
                },
            );
            match result {
                Ok(_) => self.finalize(&meeting_id).await,
                // Raced with a stop or a late callback; either way the
                // row is settled.
                Err(e) => tracing::debug!(%meeting_id, error = %e, "watchdog lost the race"),
            }
        }
    }
}

/// Background loop driving [`Supervisor::watchdog_sweep`].
pub async fn run_watchdog(supervisor: Supervisor, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        supervisor.watchdog_sweep().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::testutil::{fast_config, harness};
    use sb_domain::{BotConfig, Platform};

    #[test]
    fn verdict_requires_both_conditions() {
        let now = Utc::now();
        let grace = Duration::from_secs(90);
        let old = now - chrono::Duration::seconds(120);
        let recent = now - chrono::Duration::seconds(10);

        // Gone and silent past the grace: fail.
        assert!(should_fail(now, old, false, grace));
        // Still running: never fail, no matter how silent.
        assert!(!should_fail(now, old, true, grace));
        // Gone but recently heard from: the callback may still arrive.
        assert!(!should_fail(now, recent, false, grace));
    }

    #[test]
    fn verdict_at_exact_grace_boundary() {
        let now = Utc::now();
        let grace = Duration::from_secs(90);
        let exactly = now - chrono::Duration::seconds(90);
        assert!(should_fail(now, exactly, false, grace));
    }

    #[tokio::test]
    async fn sweep_fails_vanished_container_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.timing.callback_grace_secs = 0;
        let h = harness(dir.path(), config);

        let meeting = h
            .supervisor
            .request_bot("u1", Platform::GoogleMeet, "abc", None, BotConfig::default())
            .await
            .unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);
        let worker = h
            .supervisor
            .allocate_worker(&token, meeting.meeting_id)
            .await
            .unwrap();

        // Container gone, grace zero: the sweep must fail the meeting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        *h.runtime.running.lock() = false;
        h.supervisor.watchdog_sweep().await;

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.status, sb_domain::MeetingStatus::Failed);
        assert_eq!(m.data.error_details.as_deref(), Some("container_vanished"));
        assert_eq!(m.data.failure_stage, Some(sb_domain::FailureStage::Requested));
        assert_eq!(h.pool.released.lock().as_slice(), &[worker]);
    }

    #[tokio::test]
    async fn sweep_spares_running_containers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.timing.callback_grace_secs = 0;
        let h = harness(dir.path(), config);

        let meeting = h
            .supervisor
            .request_bot("u1", Platform::GoogleMeet, "abc", None, BotConfig::default())
            .await
            .unwrap();
        // Let the background launch mark the fake container running.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(*h.runtime.running.lock());

        h.supervisor.watchdog_sweep().await;
        assert_eq!(
            h.meetings.get(&meeting.meeting_id).unwrap().status,
            sb_domain::MeetingStatus::Requested
        );
    }

    #[tokio::test]
    async fn sweep_waits_out_the_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.timing.callback_grace_secs = 3600;
        let h = harness(dir.path(), config);

        let meeting = h
            .supervisor
            .request_bot("u1", Platform::GoogleMeet, "abc", None, BotConfig::default())
            .await
            .unwrap();
        *h.runtime.running.lock() = false;

        h.supervisor.watchdog_sweep().await;
        // Container is gone but the bot was launched moments ago.
        assert_eq!(
            h.meetings.get(&meeting.meeting_id).unwrap().status,
            sb_domain::MeetingStatus::Requested
        );
    }
}
