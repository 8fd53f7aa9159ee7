//! Shared application state passed to all API handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use sb_domain::config::Config;
use sb_meetings::MeetingStore;

use crate::api::auth::ApiKeyMap;
use crate::events::hub::EventHub;
use crate::supervisor::Supervisor;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Meeting registry (C1) + status machine (C2).
    pub meetings: Arc<MeetingStore>,
    /// Bot supervision (C4).
    pub supervisor: Supervisor,
    /// In-process fan-out (C5).
    pub hub: Arc<EventHub>,
    /// API key → owner resolution (populated from env at startup).
    pub api_keys: Arc<ApiKeyMap>,
    /// Shared outbound HTTP client (transcript proxy).
    pub http: reqwest::Client,
    pub started_at: DateTime<Utc>,
}
