//! Bot supervision: admission, container launch with retries, stop,
//! config updates, bot callbacks, and post-meeting routines.
//!
//! Each meeting's runtime bookkeeping (container name, allocation,
//! callback freshness) lives in one [`BotRuntime`] entry; the meeting row
//! itself stays authoritative in the registry and every status write goes
//! through the status machine.

pub mod runtime;
pub mod watchdog;
pub mod webhook;

pub use runtime::{ContainerRuntime, DockerRuntime, LaunchSpec};
pub use webhook::WebhookNotifier;

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use sb_allocator::WorkerAllocator;
use sb_domain::config::Config;
use sb_domain::{
    map_exit_reason, BotConfig, CompletionReason, Error, ExitDisposition, FailureStage, Meeting,
    MeetingStatus, Platform, StatusSource, TranscriptionTask, TransitionDetail,
};
use sb_meetings::{MeetingStore, TransitionError};
use sb_protocol::{config_channel, BotDirective, BotStatusChange};

use crate::error::ControlError;
use crate::events::bus::BusPublisher;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker pool seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The supervisor's view of the shared worker registry.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// `None` means no worker has free capacity right now.
    async fn allocate(&self) -> sb_domain::Result<Option<String>>;
    async fn release(&self, worker_url: &str) -> sb_domain::Result<()>;
    /// Evict `bad_url` and hand out the next candidate.
    async fn failover(&self, bad_url: &str) -> sb_domain::Result<Option<String>>;
    async fn ping(&self) -> sb_domain::Result<()>;
}

/// Production pool backed by the Redis allocator registry.
pub struct RedisPool {
    allocator: WorkerAllocator,
    capacity: u32,
}

impl RedisPool {
    pub fn new(allocator: WorkerAllocator, capacity: u32) -> Self {
        Self {
            allocator,
            capacity,
        }
    }
}

fn registry_err(e: redis::RedisError) -> Error {
    Error::Registry(e.to_string())
}

#[async_trait]
impl WorkerPool for RedisPool {
    async fn allocate(&self) -> sb_domain::Result<Option<String>> {
        self.allocator
            .allocate(self.capacity)
            .await
            .map_err(registry_err)
    }

    async fn release(&self, worker_url: &str) -> sb_domain::Result<()> {
        self.allocator.release(worker_url).await.map_err(registry_err)
    }

    async fn failover(&self, bad_url: &str) -> sb_domain::Result<Option<String>> {
        self.allocator
            .failover(bad_url, self.capacity)
            .await
            .map_err(registry_err)
    }

    async fn ping(&self) -> sb_domain::Result<()> {
        self.allocator.ping().await.map_err(registry_err)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-meeting runtime bookkeeping. Exists from admission until the
/// post-meeting routine finishes.
pub(crate) struct BotRuntime {
    pub container_name: String,
    pub launched_at: DateTime<Utc>,
    pub last_callback_at: Option<DateTime<Utc>>,
    /// Worker slot to release exactly once on exit.
    pub allocation: Option<String>,
    pub finalized: bool,
}

/// Fields a config update may change mid-meeting.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub language: Option<String>,
    pub task: Option<TranscriptionTask>,
}

/// Cheap-clone handle; background tasks (launch retries, teardown,
/// watchdog) each hold their own clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

pub struct SupervisorInner {
    pub(crate) config: Arc<Config>,
    pub(crate) meetings: Arc<MeetingStore>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) pool: Arc<dyn WorkerPool>,
    publisher: BusPublisher,
    webhooks: WebhookNotifier,
    token_secret: Vec<u8>,
    pub(crate) bots: RwLock<HashMap<Uuid, BotRuntime>>,
}

impl Deref for Supervisor {
    type Target = SupervisorInner;

    fn deref(&self) -> &SupervisorInner {
        &self.inner
    }
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        meetings: Arc<MeetingStore>,
        runtime: Arc<dyn ContainerRuntime>,
        pool: Arc<dyn WorkerPool>,
        publisher: BusPublisher,
        webhooks: WebhookNotifier,
        token_secret: Vec<u8>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                meetings,
                runtime,
                pool,
                publisher,
                webhooks,
                token_secret,
                bots: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.inner.pool
    }

    /// Rebuild runtime bookkeeping for meetings that survived a restart.
    /// Containers keep running across control-plane restarts; the
    /// watchdog re-adopts them from here.
    pub fn restore(&self) {
        let mut bots = self.bots.write();
        for meeting in self.meetings.list_non_terminal() {
            bots.entry(meeting.meeting_id).or_insert_with(|| BotRuntime {
                container_name: container_name(&meeting.meeting_id),
                launched_at: meeting.created_at,
                last_callback_at: None,
                allocation: meeting.worker_url.clone(),
                finalized: false,
            });
        }
        if !bots.is_empty() {
            tracing::info!(count = bots.len(), "re-adopted running bots after restart");
        }
    }

    // ──────────────────────────────────────────────────────────────
    // RequestBot
    // ──────────────────────────────────────────────────────────────

    pub async fn request_bot(
        &self,
        owner_id: &str,
        platform: Platform,
        native_meeting_id: &str,
        passcode: Option<String>,
        config: BotConfig,
    ) -> Result<Meeting, ControlError> {
        validate_native_id(native_meeting_id).map_err(ControlError::BadRequest)?;
        config.validate().map_err(ControlError::BadRequest)?;

        let limit = self.config.limits.concurrency_limit(owner_id);
        let meeting = self.meetings.create_if_admissible(
            owner_id,
            platform,
            native_meeting_id,
            passcode,
            config,
            limit,
        )?;

        self.bots.write().insert(
            meeting.meeting_id,
            BotRuntime {
                container_name: container_name(&meeting.meeting_id),
                launched_at: Utc::now(),
                last_callback_at: None,
                allocation: None,
                finalized: false,
            },
        );

        // Launch in the background; the caller gets the row immediately
        // and learns about launch failures through the status stream.
        let this = self.clone();
        let spec = self.launch_spec(&meeting);
        let meeting_id = meeting.meeting_id;
        tokio::spawn(async move {
            this.launch_with_retries(meeting_id, spec).await;
        });

        Ok(self.meetings.get(&meeting_id).unwrap_or(meeting))
    }

    fn launch_spec(&self, meeting: &Meeting) -> LaunchSpec {
        let base = self.config.docker.callback_base_url.trim_end_matches('/');
        LaunchSpec {
            container_name: container_name(&meeting.meeting_id),
            meeting_id: meeting.meeting_id,
            platform: meeting.platform,
            native_meeting_id: meeting.native_meeting_id.clone(),
            passcode: meeting.passcode.clone(),
            config: meeting.config.clone(),
            bot_token: self.mint_bot_token(&meeting.meeting_id),
            callback_url: format!("{base}/internal/status_change"),
            allocator_url: format!("{base}/internal/allocate"),
        }
    }

    /// Retry the container launch with exponential backoff and jitter,
    /// bounded by attempt count and a total-time ceiling. Exhaustion
    /// fails the meeting at stage `requested`.
    async fn launch_with_retries(&self, meeting_id: Uuid, spec: LaunchSpec) {
        let timing = &self.config.timing;
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(timing.launch_total_secs);
        let mut backoff = Duration::from_millis(timing.launch_backoff_ms.max(1));
        let mut last_error = String::new();

        for attempt in 1..=timing.launch_attempts {
            match self.runtime.launch(&spec).await {
                Ok(_container_id) => return,
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        %meeting_id,
                        attempt,
                        error = %last_error,
                        "bot container launch failed"
                    );
                }
            }

            if attempt == timing.launch_attempts {
                break;
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let pause = backoff + Duration::from_millis(jitter);
            if tokio::time::Instant::now() + pause >= deadline {
                tracing::warn!(%meeting_id, "launch retry budget exhausted before deadline");
                break;
            }
            tokio::time::sleep(pause).await;
            backoff *= 2;
        }

        let result = self.meetings.transition(
            &meeting_id,
            MeetingStatus::Failed,
            StatusSource::Watchdog,
            TransitionDetail::failed(
                FailureStage::Requested,
                format!("container launch failed: {last_error}"),
            ),
        );
        match result {
            Ok(_) => self.finalize(&meeting_id).await,
            // A concurrent stop already terminalized the row.
            Err(TransitionError::Invalid { .. }) | Err(TransitionError::NotFound) => {}
        }
    }

    // ──────────────────────────────────────────────────────────────
    // StopBot
    // ──────────────────────────────────────────────────────────────

    /// Stop the owner's bot for these coordinates. Unconditional: the
    /// meeting is terminal when this returns, and container teardown
    /// happens asynchronously. Stopping an already-terminal meeting is a
    /// no-op returning the same row.
    pub async fn stop_bot(
        &self,
        owner_id: &str,
        platform: Platform,
        native_meeting_id: &str,
    ) -> Result<Meeting, ControlError> {
        let Some(active) =
            self.meetings
                .find_active_by_native(owner_id, platform, native_meeting_id)
        else {
            // Idempotent replay against the most recent terminal row.
            return match self
                .meetings
                .find_latest_by_native(owner_id, platform, native_meeting_id)
            {
                Some(m) if m.status.is_terminal() => Ok(m),
                _ => Err(ControlError::NotFound),
            };
        };

        let meeting_id = active.meeting_id;
        let stopped = match self.meetings.transition(
            &meeting_id,
            MeetingStatus::Completed,
            StatusSource::Api,
            TransitionDetail::completed(CompletionReason::Stopped),
        ) {
            Ok(m) => m,
            // Lost the race against a bot exit callback; the row is
            // terminal either way.
            Err(TransitionError::Invalid { .. }) => self
                .meetings
                .get(&meeting_id)
                .ok_or(ControlError::NotFound)?,
            Err(TransitionError::NotFound) => return Err(ControlError::NotFound),
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.teardown_container(&meeting_id).await;
            this.finalize(&meeting_id).await;
        });

        Ok(stopped)
    }

    /// Ask the container to leave, then force-terminate after the grace
    /// period.
    async fn teardown_container(&self, meeting_id: &Uuid) {
        let Some(name) = self
            .bots
            .read()
            .get(meeting_id)
            .map(|rt| rt.container_name.clone())
        else {
            return;
        };
        let grace = Duration::from_secs(self.config.timing.shutdown_grace_secs);
        if let Err(e) = self.runtime.signal_stop(&name, grace).await {
            tracing::warn!(%meeting_id, error = %e, "container stop signal failed");
        }
        if let Err(e) = self.runtime.force_remove(&name).await {
            tracing::warn!(%meeting_id, error = %e, "container removal failed");
        }
    }

    // ──────────────────────────────────────────────────────────────
    // UpdateConfig
    // ──────────────────────────────────────────────────────────────

    /// Change the live bot config. Only legal while the meeting is
    /// `ACTIVE`; the bot picks the change up from the config channel.
    pub async fn update_config(
        &self,
        owner_id: &str,
        platform: Platform,
        native_meeting_id: &str,
        patch: ConfigPatch,
    ) -> Result<Meeting, ControlError> {
        let meeting = self
            .meetings
            .find_active_by_native(owner_id, platform, native_meeting_id)
            .ok_or(ControlError::NotFound)?;
        if meeting.status != MeetingStatus::Active {
            return Err(ControlError::PreconditionFailed(format!(
                "config updates require an ACTIVE meeting (currently {})",
                meeting.status
            )));
        }

        let mut config = meeting.config.clone();
        if let Some(language) = patch.language {
            config.language = Some(language);
        }
        if let Some(task) = patch.task {
            config.task = task;
        }
        config.validate().map_err(ControlError::BadRequest)?;

        let updated = self
            .meetings
            .update_bot_config(&meeting.meeting_id, config.clone())
            .ok_or(ControlError::NotFound)?;

        match serde_json::to_string(&config) {
            Ok(payload) => self
                .publisher
                .publish(config_channel(meeting.meeting_id), payload),
            Err(e) => tracing::warn!(error = %e, "config event serialization failed"),
        }
        Ok(updated)
    }

    // ──────────────────────────────────────────────────────────────
    // Bot callbacks
    // ──────────────────────────────────────────────────────────────

    /// Handle one `POST /internal/status_change` report.
    pub async fn handle_status_change(
        &self,
        bot_token: &str,
        report: BotStatusChange,
    ) -> Result<BotDirective, ControlError> {
        let meeting_id = report.connection_id;
        self.verify_bot_token(&meeting_id, bot_token)?;
        let meeting = self.meetings.get(&meeting_id).ok_or(ControlError::NotFound)?;

        if let Some(rt) = self.bots.write().get_mut(&meeting_id) {
            rt.last_callback_at = Some(Utc::now());
        }

        if report.is_exit() {
            self.handle_exit_report(meeting, report).await;
            return Ok(BotDirective::Ack);
        }

        // Startup / progress report.
        if meeting.status.is_terminal() {
            // User stop won; tell the straggler to leave without touching
            // the terminal row.
            return Ok(BotDirective::LeaveNow);
        }

        let target = match report.status.as_deref() {
            Some("joining") => MeetingStatus::Joining,
            Some("awaiting_admission") => MeetingStatus::AwaitingAdmission,
            _ => MeetingStatus::Active,
        };
        let detail = TransitionDetail {
            container_id: report.container_id,
            ..Default::default()
        };

        match self
            .meetings
            .transition(&meeting_id, target, StatusSource::BotCallback, detail)
        {
            Ok(_) => Ok(BotDirective::Ack),
            Err(TransitionError::Invalid { from, .. }) if from.is_terminal() => {
                Ok(BotDirective::LeaveNow)
            }
            // Duplicate or out-of-order progress reports are harmless.
            Err(TransitionError::Invalid { .. }) => Ok(BotDirective::Ack),
            Err(TransitionError::NotFound) => Err(ControlError::NotFound),
        }
    }

    async fn handle_exit_report(&self, meeting: Meeting, report: BotStatusChange) {
        let meeting_id = meeting.meeting_id;
        if !meeting.status.is_terminal() {
            let exit_code = report.exit_code.unwrap_or(0);
            let reason = report.reason.as_deref().unwrap_or("");
            // A pre-mapped field in the report wins; otherwise derive
            // from the reason string.
            let detail = match map_exit_reason(reason, exit_code) {
                ExitDisposition::Completed(mapped) => TransitionDetail {
                    completion_reason: Some(report.completion_reason.unwrap_or(mapped)),
                    error_details: report.error_details.clone(),
                    ..Default::default()
                },
                ExitDisposition::Failed(mapped) => TransitionDetail {
                    failure_stage: Some(report.failure_stage.unwrap_or(mapped)),
                    error_details: report
                        .error_details
                        .clone()
                        .or_else(|| Some(format!("bot exited: {reason} (code {exit_code})"))),
                    ..Default::default()
                },
            };
            let to = if exit_code == 0 {
                MeetingStatus::Completed
            } else {
                MeetingStatus::Failed
            };
            if let Err(e) =
                self.meetings
                    .transition(&meeting_id, to, StatusSource::BotCallback, detail)
            {
                // An api stop got there first; the terminal row stands.
                tracing::debug!(%meeting_id, error = %e, "exit report lost the race");
            }
        }
        self.finalize(&meeting_id).await;
    }

    // ──────────────────────────────────────────────────────────────
    // Worker allocation (bot-facing)
    // ──────────────────────────────────────────────────────────────

    /// Assign a transcription worker to this bot and record it on the
    /// meeting row.
    pub async fn allocate_worker(
        &self,
        bot_token: &str,
        meeting_id: Uuid,
    ) -> Result<String, ControlError> {
        self.verify_bot_token(&meeting_id, bot_token)?;
        let meeting = self.meetings.get(&meeting_id).ok_or(ControlError::NotFound)?;
        if meeting.status.is_terminal() {
            return Err(ControlError::PreconditionFailed(
                "meeting already ended".into(),
            ));
        }

        let worker_url = self
            .pool
            .allocate()
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?
            .ok_or_else(|| {
                ControlError::Unavailable("no transcription worker available".into())
            })?;
        self.adopt_allocation(&meeting_id, &worker_url).await;
        Ok(worker_url)
    }

    /// The bot reported its worker unhealthy; evict it and hand out the
    /// next candidate. Callable repeatedly up to the bot's retry budget.
    pub async fn failover_worker(
        &self,
        bot_token: &str,
        meeting_id: Uuid,
        bad_url: &str,
    ) -> Result<String, ControlError> {
        self.verify_bot_token(&meeting_id, bot_token)?;
        self.meetings.get(&meeting_id).ok_or(ControlError::NotFound)?;

        // The failing entry is evicted outright, slot included.
        if let Some(rt) = self.bots.write().get_mut(&meeting_id) {
            if rt.allocation.as_deref() == Some(bad_url) {
                rt.allocation = None;
            }
        }

        let worker_url = self
            .pool
            .failover(bad_url)
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?
            .ok_or_else(|| {
                ControlError::Unavailable("no replacement worker available".into())
            })?;
        self.adopt_allocation(&meeting_id, &worker_url).await;
        Ok(worker_url)
    }

    async fn adopt_allocation(&self, meeting_id: &Uuid, worker_url: &str) {
        let previous = {
            let mut bots = self.bots.write();
            match bots.get_mut(meeting_id) {
                Some(rt) => std::mem::replace(&mut rt.allocation, Some(worker_url.to_string())),
                None => None,
            }
        };
        // A re-allocation without failover returns the old slot.
        if let Some(old) = previous.filter(|old| old != worker_url) {
            if let Err(e) = self.pool.release(&old).await {
                tracing::warn!(%meeting_id, worker_url = %old, error = %e, "stale slot release failed");
            }
        }
        self.meetings.record_worker_url(meeting_id, worker_url);
    }

    // ──────────────────────────────────────────────────────────────
    // Post-meeting routine
    // ──────────────────────────────────────────────────────────────

    /// Release the allocation, fire the webhook, and drop the runtime
    /// entry. Runs at most once per meeting regardless of how many paths
    /// (stop, exit callback, watchdog, launch failure) race into it.
    pub(crate) async fn finalize(&self, meeting_id: &Uuid) {
        let (allocation, container, already_done) = {
            let mut bots = self.bots.write();
            match bots.get_mut(meeting_id) {
                Some(rt) => {
                    let done = std::mem::replace(&mut rt.finalized, true);
                    (rt.allocation.take(), Some(rt.container_name.clone()), done)
                }
                None => (None, None, true),
            }
        };
        if already_done {
            return;
        }

        if let Some(worker_url) = allocation {
            if let Err(e) = self.pool.release(&worker_url).await {
                tracing::warn!(%meeting_id, %worker_url, error = %e, "allocation release failed");
            }
        }

        if let Some(name) = container {
            if let Err(e) = self.runtime.force_remove(&name).await {
                tracing::debug!(%meeting_id, error = %e, "container cleanup failed");
            }
        }

        if let Some(meeting) = self.meetings.get(meeting_id) {
            if meeting.status.is_terminal() {
                self.webhooks.dispatch(&meeting).await;
            }
        }

        self.bots.write().remove(meeting_id);
    }

    // ──────────────────────────────────────────────────────────────
    // Reads
    // ──────────────────────────────────────────────────────────────

    /// The owner's live meetings with container liveness as of now.
    pub async fn list_with_liveness(&self, owner_id: &str) -> Vec<(Meeting, bool)> {
        let mut out = Vec::new();
        for meeting in self.meetings.list_active(owner_id) {
            let name = container_name(&meeting.meeting_id);
            let running = self.runtime.is_running(&name).await.unwrap_or(false);
            out.push((meeting, running));
        }
        out
    }

    // ──────────────────────────────────────────────────────────────
    // Bot tokens
    // ──────────────────────────────────────────────────────────────

    /// Token bound to a meeting id: HMAC over the id with the process
    /// secret. Deterministic, so callbacks keep working across restarts.
    pub fn mint_bot_token(&self, meeting_id: &Uuid) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.token_secret)
            .expect("HMAC accepts any key length");
        mac.update(meeting_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify_bot_token(&self, meeting_id: &Uuid, provided: &str) -> Result<(), ControlError> {
        let expected = self.mint_bot_token(meeting_id);
        // Hash both sides so the comparison length never depends on input.
        let ours = Sha256::digest(expected.as_bytes());
        let theirs = Sha256::digest(provided.as_bytes());
        if bool::from(ours.ct_eq(&theirs)) {
            Ok(())
        } else {
            Err(ControlError::Forbidden)
        }
    }
}

/// Deterministic container name for a meeting's bot.
pub fn container_name(meeting_id: &Uuid) -> String {
    format!("stenobot-{meeting_id}")
}

fn validate_native_id(native_meeting_id: &str) -> Result<(), String> {
    if native_meeting_id.is_empty() {
        return Err("native_meeting_id: must not be empty".into());
    }
    if native_meeting_id.len() > 256 {
        return Err("native_meeting_id: too long (max 256)".into());
    }
    if native_meeting_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err("native_meeting_id: whitespace and control characters not allowed".into());
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test doubles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━


// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    async fn request(
        h: &Harness,
        owner: &str,
        native: &str,
    ) -> Result<Meeting, ControlError> {
        h.supervisor
            .request_bot(
                owner,
                Platform::GoogleMeet,
                native,
                None,
                BotConfig::default(),
            )
            .await
    }

    fn exit_report(meeting_id: Uuid, reason: &str, exit_code: i64) -> BotStatusChange {
        BotStatusChange {
            connection_id: meeting_id,
            container_id: None,
            status: None,
            reason: Some(reason.into()),
            exit_code: Some(exit_code),
            error_details: None,
            completion_reason: None,
            failure_stage: None,
            timestamp: Utc::now(),
        }
    }

    fn startup_report(meeting_id: Uuid, status: &str) -> BotStatusChange {
        BotStatusChange {
            connection_id: meeting_id,
            container_id: Some("c0ffee".into()),
            status: Some(status.into()),
            reason: None,
            exit_code: None,
            error_details: None,
            completion_reason: None,
            failure_stage: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn request_bot_creates_row_and_launches_container() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());

        let meeting = request(&h, "u1", "abc-defg-hij").await.unwrap();
        assert_eq!(meeting.status, MeetingStatus::Requested);

        // Launch runs in the background.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let launches = h.runtime.launches.lock();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].meeting_id, meeting.meeting_id);
        assert!(launches[0].callback_url.ends_with("/internal/status_change"));
        assert!(!launches[0].bot_token.is_empty());
    }

    #[tokio::test]
    async fn request_bot_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());

        let err = request(&h, "u1", "").await.unwrap_err();
        assert!(matches!(err, ControlError::BadRequest(_)));

        let err = request(&h, "u1", "has spaces").await.unwrap_err();
        assert!(matches!(err, ControlError::BadRequest(_)));

        let err = h
            .supervisor
            .request_bot(
                "u1",
                Platform::GoogleMeet,
                "ok-id",
                None,
                BotConfig {
                    language: Some("not-a-code".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::BadRequest(_)));
    }

    #[tokio::test]
    async fn duplicate_and_limit_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.limits.default_concurrency = 2;
        let h = harness(dir.path(), config);

        request(&h, "u1", "meet-a").await.unwrap();
        let err = request(&h, "u1", "meet-a").await.unwrap_err();
        assert!(matches!(err, ControlError::Duplicate));

        request(&h, "u1", "meet-b").await.unwrap();
        let err = request(&h, "u1", "meet-c").await.unwrap_err();
        assert!(matches!(err, ControlError::LimitReached));

        // Stop B, then C is admitted immediately.
        h.supervisor
            .stop_bot("u1", Platform::GoogleMeet, "meet-b")
            .await
            .unwrap();
        request(&h, "u1", "meet-c").await.unwrap();
    }

    #[tokio::test]
    async fn launch_retries_then_fails_meeting() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        *h.runtime.fail_launches.lock() = 10; // more than the budget

        let meeting = request(&h, "u1", "abc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.status, MeetingStatus::Failed);
        assert_eq!(m.data.failure_stage, Some(FailureStage::Requested));
        assert!(m
            .data
            .error_details
            .as_deref()
            .unwrap()
            .contains("launch failed"));
    }

    #[tokio::test]
    async fn launch_recovers_after_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        *h.runtime.fail_launches.lock() = 1; // one transient error

        let meeting = request(&h, "u1", "abc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(h.runtime.launches.lock().len(), 1);
        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.status, MeetingStatus::Requested);
    }

    #[tokio::test]
    async fn startup_callback_activates_meeting() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        let directive = h
            .supervisor
            .handle_status_change(&token, startup_report(meeting.meeting_id, "active"))
            .await
            .unwrap();
        assert!(matches!(directive, BotDirective::Ack));

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.status, MeetingStatus::Active);
        assert_eq!(m.container_id.as_deref(), Some("c0ffee"));
        assert!(m.started_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_startup_callback_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        for _ in 0..2 {
            let directive = h
                .supervisor
                .handle_status_change(&token, startup_report(meeting.meeting_id, "active"))
                .await
                .unwrap();
            assert!(matches!(directive, BotDirective::Ack));
        }
        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        // Exactly one REQUESTED -> ACTIVE transition recorded.
        assert_eq!(m.data.transitions.len(), 1);
    }

    #[tokio::test]
    async fn startup_callback_after_stop_gets_leave_now() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        h.supervisor
            .stop_bot("u1", Platform::GoogleMeet, "abc")
            .await
            .unwrap();

        let directive = h
            .supervisor
            .handle_status_change(&token, startup_report(meeting.meeting_id, "active"))
            .await
            .unwrap();
        assert!(matches!(directive, BotDirective::LeaveNow));
        assert_eq!(
            h.meetings.get(&meeting.meeting_id).unwrap().status,
            MeetingStatus::Completed
        );
    }

    #[tokio::test]
    async fn callback_with_bad_token_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();

        let err = h
            .supervisor
            .handle_status_change("wrong-token", startup_report(meeting.meeting_id, "active"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Forbidden));
    }

    #[tokio::test]
    async fn clean_exit_completes_with_mapped_reason() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        h.supervisor
            .handle_status_change(&token, startup_report(meeting.meeting_id, "active"))
            .await
            .unwrap();
        h.supervisor
            .handle_status_change(&token, exit_report(meeting.meeting_id, "left_alone", 0))
            .await
            .unwrap();

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.status, MeetingStatus::Completed);
        assert_eq!(m.data.completion_reason, Some(CompletionReason::LeftAlone));
    }

    #[tokio::test]
    async fn joining_failure_records_stage_and_details() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        let mut report = exit_report(meeting.meeting_id, "teams_error", 1);
        report.error_details = Some("join page never loaded".into());
        h.supervisor.handle_status_change(&token, report).await.unwrap();

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.status, MeetingStatus::Failed);
        assert_eq!(m.data.failure_stage, Some(FailureStage::Joining));
        assert_eq!(m.data.error_details.as_deref(), Some("join page never loaded"));
    }

    #[tokio::test]
    async fn admission_timeout_completes_not_fails() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        h.supervisor
            .handle_status_change(
                &token,
                startup_report(meeting.meeting_id, "awaiting_admission"),
            )
            .await
            .unwrap();
        h.supervisor
            .handle_status_change(&token, exit_report(meeting.meeting_id, "admission_failed", 0))
            .await
            .unwrap();

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.status, MeetingStatus::Completed);
        assert_eq!(
            m.data.completion_reason,
            Some(CompletionReason::AwaitingAdmissionTimeout)
        );
    }

    #[tokio::test]
    async fn api_stop_wins_over_clean_exit_race() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        h.supervisor
            .handle_status_change(&token, startup_report(meeting.meeting_id, "active"))
            .await
            .unwrap();
        h.supervisor
            .stop_bot("u1", Platform::GoogleMeet, "abc")
            .await
            .unwrap();

        // Late clean exit: acknowledged, status stays stopped.
        h.supervisor
            .handle_status_change(
                &token,
                exit_report(meeting.meeting_id, "self_initiated_leave", 0),
            )
            .await
            .unwrap();

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.status, MeetingStatus::Completed);
        assert_eq!(m.data.completion_reason, Some(CompletionReason::Stopped));
    }

    #[tokio::test]
    async fn api_stop_wins_over_failure_exit_race() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        h.supervisor
            .handle_status_change(&token, startup_report(meeting.meeting_id, "active"))
            .await
            .unwrap();
        h.supervisor
            .stop_bot("u1", Platform::GoogleMeet, "abc")
            .await
            .unwrap();
        h.supervisor
            .handle_status_change(&token, exit_report(meeting.meeting_id, "heap_exhausted", 1))
            .await
            .unwrap();

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        // COMPLETED, not FAILED: the user's stop already won.
        assert_eq!(m.status, MeetingStatus::Completed);
        assert_eq!(m.data.completion_reason, Some(CompletionReason::Stopped));
        assert_eq!(m.data.failure_stage, None);
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_terminal_meeting() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        request(&h, "u1", "abc").await.unwrap();

        let first = h
            .supervisor
            .stop_bot("u1", Platform::GoogleMeet, "abc")
            .await
            .unwrap();
        let second = h
            .supervisor
            .stop_bot("u1", Platform::GoogleMeet, "abc")
            .await
            .unwrap();
        assert_eq!(first.meeting_id, second.meeting_id);
        assert_eq!(second.status, MeetingStatus::Completed);
    }

    #[tokio::test]
    async fn stop_without_any_row_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let err = h
            .supervisor
            .stop_bot("u1", Platform::GoogleMeet, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound));
    }

    #[tokio::test]
    async fn stop_tears_down_container_and_releases_worker() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        let worker = h
            .supervisor
            .allocate_worker(&token, meeting.meeting_id)
            .await
            .unwrap();
        h.supervisor
            .stop_bot("u1", Platform::GoogleMeet, "abc")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let name = container_name(&meeting.meeting_id);
        assert!(h.runtime.stopped.lock().contains(&name));
        assert!(h.runtime.removed.lock().contains(&name));
        assert_eq!(h.pool.released.lock().as_slice(), &[worker]);
    }

    #[tokio::test]
    async fn allocation_is_released_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        h.supervisor
            .allocate_worker(&token, meeting.meeting_id)
            .await
            .unwrap();

        // Exit callback and stop race into finalize; only one release.
        h.supervisor
            .handle_status_change(
                &token,
                exit_report(meeting.meeting_id, "self_initiated_leave", 0),
            )
            .await
            .unwrap();
        let _ = h
            .supervisor
            .stop_bot("u1", Platform::GoogleMeet, "abc")
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.pool.released.lock().len(), 1);
    }

    #[tokio::test]
    async fn allocate_records_worker_on_meeting() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        let url = h
            .supervisor
            .allocate_worker(&token, meeting.meeting_id)
            .await
            .unwrap();
        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.worker_url.as_deref(), Some(url.as_str()));
    }

    #[tokio::test]
    async fn failover_evicts_and_reassigns() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        let first = h
            .supervisor
            .allocate_worker(&token, meeting.meeting_id)
            .await
            .unwrap();
        let second = h
            .supervisor
            .failover_worker(&token, meeting.meeting_id, &first)
            .await
            .unwrap();
        assert_ne!(first, second);

        let m = h.meetings.get(&meeting.meeting_id).unwrap();
        assert_eq!(m.worker_url.as_deref(), Some(second.as_str()));

        // Capacity 1 and one surviving worker: the next allocation has
        // nowhere to go.
        let other = request(&h, "u2", "other").await.unwrap();
        let other_token = h.supervisor.mint_bot_token(&other.meeting_id);
        let err = h
            .supervisor
            .allocate_worker(&other_token, other.meeting_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Unavailable(_)));
    }

    #[tokio::test]
    async fn update_config_requires_active() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);

        let patch = ConfigPatch {
            language: Some("fr".into()),
            task: Some(TranscriptionTask::Translate),
        };
        let err = h
            .supervisor
            .update_config("u1", Platform::GoogleMeet, "abc", patch.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::PreconditionFailed(_)));

        h.supervisor
            .handle_status_change(&token, startup_report(meeting.meeting_id, "active"))
            .await
            .unwrap();
        let updated = h
            .supervisor
            .update_config("u1", Platform::GoogleMeet, "abc", patch)
            .await
            .unwrap();
        assert_eq!(updated.config.language.as_deref(), Some("fr"));
        assert_eq!(updated.config.task, TranscriptionTask::Translate);
    }

    #[tokio::test]
    async fn update_config_publishes_bus_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();
        let token = h.supervisor.mint_bot_token(&meeting.meeting_id);
        h.supervisor
            .handle_status_change(&token, startup_report(meeting.meeting_id, "active"))
            .await
            .unwrap();

        h.supervisor
            .update_config(
                "u1",
                Platform::GoogleMeet,
                "abc",
                ConfigPatch {
                    language: Some("de".into()),
                    task: None,
                },
            )
            .await
            .unwrap();

        let msg = h.bus_rx.try_recv().expect("config event published");
        assert_eq!(msg.channel, config_channel(meeting.meeting_id));
        assert!(msg.payload.contains("\"de\""));
    }

    #[tokio::test]
    async fn bot_tokens_are_deterministic_and_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(h.supervisor.mint_bot_token(&a), h.supervisor.mint_bot_token(&a));
        assert_ne!(h.supervisor.mint_bot_token(&a), h.supervisor.mint_bot_token(&b));
    }

    #[tokio::test]
    async fn restore_readopts_non_terminal_meetings() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path(), fast_config());
        let meeting = request(&h, "u1", "abc").await.unwrap();

        // A fresh supervisor over the same registry (simulated restart).
        let h2 = harness(dir.path(), fast_config());
        assert!(h2.supervisor.bots.read().is_empty());
        h2.supervisor.restore();
        assert!(h2.supervisor.bots.read().contains_key(&meeting.meeting_id));
    }
}
