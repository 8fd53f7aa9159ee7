//! Durable meeting registry — the single source of truth for meeting rows.
//!
//! Rows live in memory behind one `RwLock` (the serialization point for a
//! meeting's status) with a secondary index on
//! `(owner, platform, native_meeting_id)`. Every mutation is appended to a
//! JSONL log; reload is last-write-wins per `meeting_id`, and old terminal
//! rows are pruned from disk at startup.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use sb_domain::{BotConfig, Meeting, Platform, StatusTransition};

/// Receives every committed status transition, in commit order.
///
/// Called with the registry lock held: implementations must not block
/// (enqueue and return).
pub trait StatusSink: Send + Sync {
    fn publish(&self, meeting: &Meeting, transition: &StatusTransition);
}

/// Sink that drops everything; for tooling and tests that don't observe
/// events.
pub struct NoopSink;

impl StatusSink for NoopSink {
    fn publish(&self, _meeting: &Meeting, _transition: &StatusTransition) {}
}

/// Why an admission request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// A non-terminal row already exists for these coordinates.
    Duplicate,
    /// The owner is at their concurrency limit.
    LimitReached,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal rows kept in memory (and on disk) beyond the live set.
const MAX_TERMINAL_IN_MEMORY: usize = 5000;

type NativeKey = (String, Platform, String);

pub struct MeetingStore {
    pub(crate) inner: RwLock<StoreInner>,
    log_path: PathBuf,
    pub(crate) sink: Arc<dyn StatusSink>,
}

pub(crate) struct StoreInner {
    pub(crate) meetings: HashMap<Uuid, Meeting>,
    /// Secondary index; ids ordered by creation, newest last.
    by_native: HashMap<NativeKey, Vec<Uuid>>,
}

impl StoreInner {
    fn new(meetings: HashMap<Uuid, Meeting>) -> Self {
        let mut by_native: HashMap<NativeKey, Vec<Uuid>> = HashMap::new();
        let mut ordered: Vec<&Meeting> = meetings.values().collect();
        ordered.sort_by_key(|m| m.created_at);
        for m in ordered {
            by_native.entry(native_key(m)).or_default().push(m.meeting_id);
        }
        Self {
            meetings,
            by_native,
        }
    }
}

fn native_key(m: &Meeting) -> NativeKey {
    (m.owner_id.clone(), m.platform, m.native_meeting_id.clone())
}

impl MeetingStore {
    /// Open (or create) the registry under `state_path`, reloading any
    /// prior rows from the JSONL log.
    pub fn new(state_path: &Path, sink: Arc<dyn StatusSink>) -> Self {
        let dir = state_path.join("meetings");
        std::fs::create_dir_all(&dir).ok();

        let log_path = dir.join("meetings.jsonl");
        let (meetings, dirty) = Self::load(&log_path);
        if dirty {
            Self::rewrite_jsonl(&log_path, meetings.values());
        }
        tracing::info!(
            rows = meetings.len(),
            path = %log_path.display(),
            "meeting registry loaded"
        );

        Self {
            inner: RwLock::new(StoreInner::new(meetings)),
            log_path,
            sink,
        }
    }

    /// Read the JSONL log, last write wins per id. Returns the rows plus
    /// whether the on-disk log should be compacted (duplicate lines or
    /// excess terminal rows).
    fn load(path: &Path) -> (HashMap<Uuid, Meeting>, bool) {
        let mut map: HashMap<Uuid, Meeting> = HashMap::new();
        let mut lines_read = 0usize;
        if let Ok(content) = std::fs::read_to_string(path) {
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                lines_read += 1;
                match serde_json::from_str::<Meeting>(line) {
                    Ok(m) => {
                        map.insert(m.meeting_id, m);
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping unreadable registry line"),
                }
            }
        }

        // Drop the oldest terminal rows past the cap; live rows always stay.
        let mut terminal: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = map
            .values()
            .filter(|m| m.status.is_terminal())
            .map(|m| (m.meeting_id, m.ended_at.unwrap_or(m.created_at)))
            .collect();
        let mut pruned = false;
        if terminal.len() > MAX_TERMINAL_IN_MEMORY {
            terminal.sort_by_key(|(_, ended)| *ended);
            let excess = terminal.len() - MAX_TERMINAL_IN_MEMORY;
            for (id, _) in terminal.into_iter().take(excess) {
                map.remove(&id);
            }
            pruned = true;
        }

        let dirty = pruned || lines_read > map.len();
        (map, dirty)
    }

    /// Rewrite the JSONL log with exactly the given rows (compaction).
    fn rewrite_jsonl<'a>(path: &Path, rows: impl Iterator<Item = &'a Meeting>) {
        let tmp = path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for m in rows {
                if let Ok(json) = serde_json::to_string(m) {
                    if writeln!(f, "{json}").is_err() {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }

    /// Append the current snapshot of a row to the log. Called with the
    /// registry lock held so per-meeting lines land in commit order.
    pub(crate) fn persist(&self, meeting: &Meeting) {
        if let Ok(json) = serde_json::to_string(meeting) {
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
            {
                let _ = writeln!(file, "{json}");
            }
        }
    }

    // ──────────────────────────────────────────────────────────────
    // Admission
    // ──────────────────────────────────────────────────────────────

    /// The admission transaction: duplicate check, owner concurrency
    /// count, and insert, all under one write lock.
    pub fn create_if_admissible(
        &self,
        owner_id: &str,
        platform: Platform,
        native_meeting_id: &str,
        passcode: Option<String>,
        config: BotConfig,
        concurrency_limit: u32,
    ) -> Result<Meeting, AdmitError> {
        let mut inner = self.inner.write();

        let key = (
            owner_id.to_string(),
            platform,
            native_meeting_id.to_string(),
        );
        let has_live_duplicate = inner
            .by_native
            .get(&key)
            .map(|ids| {
                ids.iter().any(|id| {
                    inner
                        .meetings
                        .get(id)
                        .is_some_and(|m| !m.status.is_terminal())
                })
            })
            .unwrap_or(false);
        if has_live_duplicate {
            return Err(AdmitError::Duplicate);
        }

        let live = inner
            .meetings
            .values()
            .filter(|m| m.owner_id == owner_id && !m.status.is_terminal())
            .count();
        if live as u32 >= concurrency_limit {
            return Err(AdmitError::LimitReached);
        }

        let meeting = Meeting::new(owner_id, platform, native_meeting_id, passcode, config);
        inner.by_native.entry(key).or_default().push(meeting.meeting_id);
        inner.meetings.insert(meeting.meeting_id, meeting.clone());
        self.persist(&meeting);
        Ok(meeting)
    }

    // ──────────────────────────────────────────────────────────────
    // Reads
    // ──────────────────────────────────────────────────────────────

    pub fn get(&self, meeting_id: &Uuid) -> Option<Meeting> {
        self.inner.read().meetings.get(meeting_id).cloned()
    }

    /// The non-terminal row for these coordinates, if any. The
    /// single-active invariant guarantees at most one.
    pub fn find_active_by_native(
        &self,
        owner_id: &str,
        platform: Platform,
        native_meeting_id: &str,
    ) -> Option<Meeting> {
        let inner = self.inner.read();
        let key = (
            owner_id.to_string(),
            platform,
            native_meeting_id.to_string(),
        );
        inner.by_native.get(&key).and_then(|ids| {
            ids.iter()
                .filter_map(|id| inner.meetings.get(id))
                .find(|m| !m.status.is_terminal())
                .cloned()
        })
    }

    /// The newest row for these coordinates regardless of status.
    pub fn find_latest_by_native(
        &self,
        owner_id: &str,
        platform: Platform,
        native_meeting_id: &str,
    ) -> Option<Meeting> {
        let inner = self.inner.read();
        let key = (
            owner_id.to_string(),
            platform,
            native_meeting_id.to_string(),
        );
        inner.by_native.get(&key).and_then(|ids| {
            ids.iter()
                .rev()
                .filter_map(|id| inner.meetings.get(id))
                .max_by_key(|m| m.created_at)
                .cloned()
        })
    }

    /// The owner's non-terminal meetings.
    pub fn list_active(&self, owner_id: &str) -> Vec<Meeting> {
        let mut rows: Vec<Meeting> = self
            .inner
            .read()
            .meetings
            .values()
            .filter(|m| m.owner_id == owner_id && !m.status.is_terminal())
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        rows
    }

    /// Every non-terminal meeting (watchdog sweep input).
    pub fn list_non_terminal(&self) -> Vec<Meeting> {
        self.inner
            .read()
            .meetings
            .values()
            .filter(|m| !m.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Row counts by status, for the health endpoint.
    pub fn status_counts(&self) -> HashMap<String, usize> {
        let inner = self.inner.read();
        let mut counts = HashMap::new();
        for m in inner.meetings.values() {
            *counts.entry(m.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    // ──────────────────────────────────────────────────────────────
    // Runtime-field writes (not status; status goes through transition)
    // ──────────────────────────────────────────────────────────────

    /// Record the worker assigned to this meeting's bot. Returns the
    /// updated row, or `None` if the meeting is unknown.
    pub fn record_worker_url(&self, meeting_id: &Uuid, worker_url: &str) -> Option<Meeting> {
        let inner = &mut *self.inner.write();
        let meeting = inner.meetings.get_mut(meeting_id)?;
        meeting.worker_url = Some(worker_url.to_string());
        let snapshot = meeting.clone();
        self.persist(&snapshot);
        Some(snapshot)
    }

    /// Replace the live bot config (the `ACTIVE`-only precondition is the
    /// supervisor's to enforce).
    pub fn update_bot_config(&self, meeting_id: &Uuid, config: BotConfig) -> Option<Meeting> {
        let inner = &mut *self.inner.write();
        let meeting = inner.meetings.get_mut(meeting_id)?;
        meeting.config = config;
        let snapshot = meeting.clone();
        self.persist(&snapshot);
        Some(snapshot)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use sb_domain::{MeetingStatus, StatusSource, TransitionDetail};

    fn store(dir: &Path) -> MeetingStore {
        MeetingStore::new(dir, Arc::new(NoopSink))
    }

    fn admit(store: &MeetingStore, owner: &str, native: &str, limit: u32) -> Meeting {
        store
            .create_if_admissible(
                owner,
                Platform::GoogleMeet,
                native,
                None,
                BotConfig::default(),
                limit,
            )
            .unwrap()
    }

    #[test]
    fn create_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let m = admit(&store, "u1", "abc-defg-hij", 5);
        assert_eq!(m.status, MeetingStatus::Requested);

        let found = store
            .find_active_by_native("u1", Platform::GoogleMeet, "abc-defg-hij")
            .unwrap();
        assert_eq!(found.meeting_id, m.meeting_id);
        assert!(store
            .find_active_by_native("u1", Platform::Teams, "abc-defg-hij")
            .is_none());
        assert!(store
            .find_active_by_native("u2", Platform::GoogleMeet, "abc-defg-hij")
            .is_none());
    }

    #[test]
    fn duplicate_rejected_while_live() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        admit(&store, "u1", "abc", 5);
        let err = store
            .create_if_admissible(
                "u1",
                Platform::GoogleMeet,
                "abc",
                None,
                BotConfig::default(),
                5,
            )
            .unwrap_err();
        assert_eq!(err, AdmitError::Duplicate);
    }

    #[test]
    fn concurrency_limit_enforced_then_released() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let a = admit(&store, "u1", "meet-a", 2);
        let _b = admit(&store, "u1", "meet-b", 2);

        let err = store
            .create_if_admissible(
                "u1",
                Platform::GoogleMeet,
                "meet-c",
                None,
                BotConfig::default(),
                2,
            )
            .unwrap_err();
        assert_eq!(err, AdmitError::LimitReached);

        // Another owner is unaffected.
        admit(&store, "u2", "meet-c", 2);

        // Terminate A; C becomes admissible immediately.
        store
            .transition(
                &a.meeting_id,
                MeetingStatus::Completed,
                StatusSource::Api,
                TransitionDetail::default(),
            )
            .unwrap();
        admit(&store, "u1", "meet-c", 2);
    }

    #[test]
    fn same_native_id_reusable_after_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let first = admit(&store, "u1", "abc", 5);
        store
            .transition(
                &first.meeting_id,
                MeetingStatus::Completed,
                StatusSource::Api,
                TransitionDetail::default(),
            )
            .unwrap();

        let second = admit(&store, "u1", "abc", 5);
        assert_ne!(first.meeting_id, second.meeting_id);

        // Latest-by-native prefers the newer row.
        let latest = store
            .find_latest_by_native("u1", Platform::GoogleMeet, "abc")
            .unwrap();
        assert_eq!(latest.meeting_id, second.meeting_id);
    }

    #[test]
    fn persistence_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = store(dir.path());
            let m = admit(&store, "u1", "abc", 5);
            store.record_worker_url(&m.meeting_id, "ws://worker-1:9090");
            m.meeting_id
        };

        let reloaded = store(dir.path());
        let m = reloaded.get(&id).unwrap();
        assert_eq!(m.worker_url.as_deref(), Some("ws://worker-1:9090"));
        assert_eq!(m.status, MeetingStatus::Requested);
        // Secondary index rebuilt.
        assert!(reloaded
            .find_active_by_native("u1", Platform::GoogleMeet, "abc")
            .is_some());
    }

    #[test]
    fn list_active_excludes_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let a = admit(&store, "u1", "a", 5);
        admit(&store, "u1", "b", 5);
        store
            .transition(
                &a.meeting_id,
                MeetingStatus::Failed,
                StatusSource::Watchdog,
                TransitionDetail::default(),
            )
            .unwrap();

        let active = store.list_active("u1");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].native_meeting_id, "b");
    }

    #[test]
    fn status_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        admit(&store, "u1", "a", 5);
        admit(&store, "u1", "b", 5);
        let counts = store.status_counts();
        assert_eq!(counts.get("REQUESTED"), Some(&2));
    }
}
