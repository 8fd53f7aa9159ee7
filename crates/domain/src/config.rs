//! Application configuration, loaded from `config.toml` with env overrides.
//!
//! Every section has serde defaults so a missing file yields a runnable
//! dev configuration; `Config::validate()` reports anything that would
//! misbehave in production.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub transcripts: TranscriptsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Environment variable holding `owner:key` API-key pairs.
    #[serde(default = "d_api_keys_env")]
    pub api_keys_env: String,
    /// Backpressure cap on in-flight HTTP requests.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            api_keys_env: d_api_keys_env(),
            max_concurrent_requests: d_max_concurrent(),
        }
    }
}

fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_port() -> u16 {
    8056
}
fn d_api_keys_env() -> String {
    "SB_API_KEYS".into()
}
fn d_max_concurrent() -> usize {
    256
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the meeting registry JSONL log.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Redis (allocator registry + event bus)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "d_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: d_redis_url() }
    }
}

fn d_redis_url() -> String {
    "redis://127.0.0.1:6379/".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Docker (bot containers)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Image the bot containers run.
    #[serde(default = "d_bot_image")]
    pub image: String,
    /// Docker network to attach bot containers to, if any.
    #[serde(default)]
    pub network: Option<String>,
    /// Base URL bots use to reach this control plane (callbacks + allocator).
    #[serde(default = "d_callback_base")]
    pub callback_base_url: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: d_bot_image(),
            network: None,
            callback_base_url: d_callback_base(),
        }
    }
}

fn d_bot_image() -> String {
    "stenobot/bot:latest".into()
}
fn d_callback_base() -> String {
    "http://gateway:8056".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Max non-terminal meetings per owner unless overridden.
    #[serde(default = "d_default_concurrency")]
    pub default_concurrency: u32,
    /// Per-owner overrides of the concurrency limit.
    #[serde(default)]
    pub per_owner: HashMap<String, u32>,
    /// Max simultaneous bot sessions one transcription worker accepts.
    #[serde(default = "d_worker_capacity")]
    pub worker_capacity: u32,
    /// Outbound queue depth per subscriber before oldest frames drop.
    #[serde(default = "d_queue_depth")]
    pub subscriber_queue_depth: usize,
}

impl LimitsConfig {
    pub fn concurrency_limit(&self, owner_id: &str) -> u32 {
        self.per_owner
            .get(owner_id)
            .copied()
            .unwrap_or(self.default_concurrency)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_concurrency: d_default_concurrency(),
            per_owner: HashMap::new(),
            worker_capacity: d_worker_capacity(),
            subscriber_queue_depth: d_queue_depth(),
        }
    }
}

fn d_default_concurrency() -> u32 {
    5
}
fn d_worker_capacity() -> u32 {
    10
}
fn d_queue_depth() -> usize {
    256
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// TTL on worker heartbeat keys; absence marks a worker dead.
    #[serde(default = "d_heartbeat_ttl")]
    pub heartbeat_ttl_secs: u64,
    /// Period of the dead-worker reaper; keep at or below the heartbeat TTL.
    #[serde(default = "d_reaper_period")]
    pub reaper_period_secs: u64,
    /// Container launch attempts before the meeting fails.
    #[serde(default = "d_launch_attempts")]
    pub launch_attempts: u32,
    /// Base backoff between launch attempts (doubles each retry, jittered).
    #[serde(default = "d_launch_backoff")]
    pub launch_backoff_ms: u64,
    /// Hard ceiling over all launch attempts.
    #[serde(default = "d_launch_total")]
    pub launch_total_secs: u64,
    /// Grace between a stop signal and force-terminating the container.
    #[serde(default = "d_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// How long after a container vanishes the watchdog waits for a
    /// straggling exit callback before declaring the meeting failed.
    #[serde(default = "d_callback_grace")]
    pub callback_grace_secs: u64,
    /// Watchdog sweep period.
    #[serde(default = "d_watchdog_period")]
    pub watchdog_period_secs: u64,
    /// End-to-end budget for a bot request.
    #[serde(default = "d_request_timeout")]
    pub request_timeout_secs: u64,
    /// Per-frame write budget before a subscriber connection is dropped.
    #[serde(default = "d_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: d_heartbeat_ttl(),
            reaper_period_secs: d_reaper_period(),
            launch_attempts: d_launch_attempts(),
            launch_backoff_ms: d_launch_backoff(),
            launch_total_secs: d_launch_total(),
            shutdown_grace_secs: d_shutdown_grace(),
            callback_grace_secs: d_callback_grace(),
            watchdog_period_secs: d_watchdog_period(),
            request_timeout_secs: d_request_timeout(),
            write_timeout_secs: d_write_timeout(),
        }
    }
}

fn d_heartbeat_ttl() -> u64 {
    30
}
fn d_reaper_period() -> u64 {
    10
}
fn d_launch_attempts() -> u32 {
    3
}
fn d_launch_backoff() -> u64 {
    500
}
fn d_launch_total() -> u64 {
    60
}
fn d_shutdown_grace() -> u64 {
    30
}
fn d_callback_grace() -> u64 {
    90
}
fn d_watchdog_period() -> u64 {
    30
}
fn d_request_timeout() -> u64 {
    30
}
fn d_write_timeout() -> u64 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcript store proxy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TranscriptsConfig {
    /// Base URL of the external transcript store. Unset disables the
    /// transcript read endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound webhooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "d_webhook_attempts")]
    pub attempts: u32,
    #[serde(default = "d_webhook_backoff")]
    pub backoff_ms: u64,
    #[serde(default = "d_webhook_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            attempts: d_webhook_attempts(),
            backoff_ms: d_webhook_backoff(),
            timeout_secs: d_webhook_timeout(),
        }
    }
}

fn d_webhook_attempts() -> u32 {
    3
}
fn d_webhook_backoff() -> u64 {
    1000
}
fn d_webhook_timeout() -> u64 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut error = |field: &str, message: String| {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        };

        if self.server.port == 0 {
            error("server.port", "port must be greater than 0".into());
        }
        if self.docker.image.trim().is_empty() {
            error("docker.image", "bot image must not be empty".into());
        }
        if self.redis.url.trim().is_empty() {
            error("redis.url", "registry URL must not be empty".into());
        }
        if self.limits.default_concurrency == 0 {
            error(
                "limits.default_concurrency",
                "owners must be allowed at least one bot".into(),
            );
        }
        if self.limits.worker_capacity == 0 {
            error(
                "limits.worker_capacity",
                "workers must accept at least one session".into(),
            );
        }
        if self.timing.launch_attempts == 0 {
            error("timing.launch_attempts", "at least one attempt required".into());
        }
        if self.timing.reaper_period_secs > self.timing.heartbeat_ttl_secs {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "timing.reaper_period_secs".into(),
                message: format!(
                    "reaper period {}s exceeds heartbeat TTL {}s; dead workers will linger",
                    self.timing.reaper_period_secs, self.timing.heartbeat_ttl_secs
                ),
            });
        }
        if self.limits.subscriber_queue_depth < 8 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "limits.subscriber_queue_depth".into(),
                message: "very small queues drop frames under normal jitter".into(),
            });
        }
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "redis.url".into(),
                message: format!("unexpected scheme in {:?}", self.redis.url),
            });
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|e| e.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8056);
        assert_eq!(config.limits.default_concurrency, 5);
        assert_eq!(config.timing.launch_attempts, 3);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [limits]
            default_concurrency = 2

            [limits.per_owner]
            "big-tenant" = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.limits.concurrency_limit("big-tenant"), 50);
        assert_eq!(config.limits.concurrency_limit("someone-else"), 2);
        // Untouched sections keep defaults.
        assert_eq!(config.timing.shutdown_grace_secs, 30);
    }

    #[test]
    fn zero_port_is_an_error() {
        let config: Config = toml::from_str("[server]\nport = 0").unwrap();
        assert!(config
            .validate()
            .iter()
            .any(|e| e.severity == ConfigSeverity::Error && e.field == "server.port"));
    }

    #[test]
    fn slow_reaper_is_a_warning() {
        let config: Config = toml::from_str(
            "[timing]\nreaper_period_secs = 120\nheartbeat_ttl_secs = 30",
        )
        .unwrap();
        assert!(config
            .validate()
            .iter()
            .any(|e| e.severity == ConfigSeverity::Warning
                && e.field == "timing.reaper_period_secs"));
    }
}
