//! Container runtime seam: the supervisor launches and reaps bot worker
//! containers through this trait; production uses the Docker API, tests
//! plug in a recording fake.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use uuid::Uuid;

use sb_domain::config::DockerConfig;
use sb_domain::{BotConfig, Error, Platform, Result};

/// Everything a bot container needs to join its meeting and talk back.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub container_name: String,
    pub meeting_id: Uuid,
    pub platform: Platform,
    pub native_meeting_id: String,
    pub passcode: Option<String>,
    pub config: BotConfig,
    /// Per-meeting credential for the internal callback surface.
    pub bot_token: String,
    /// Where the bot POSTs status changes.
    pub callback_url: String,
    /// Where the bot requests (and fails over) its transcription worker.
    pub allocator_url: String,
}

impl LaunchSpec {
    /// Environment handed to the container.
    pub fn env(&self) -> Vec<String> {
        let mut env = vec![
            format!("MEETING_ID={}", self.meeting_id),
            format!("PLATFORM={}", self.platform),
            format!("NATIVE_MEETING_ID={}", self.native_meeting_id),
            format!("BOT_TOKEN={}", self.bot_token),
            format!("CALLBACK_URL={}", self.callback_url),
            format!("ALLOCATOR_URL={}", self.allocator_url),
            format!(
                "TASK={}",
                serde_json::to_value(self.config.task)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "transcribe".into())
            ),
        ];
        if let Some(passcode) = &self.passcode {
            env.push(format!("MEETING_PASSCODE={passcode}"));
        }
        if let Some(language) = &self.config.language {
            env.push(format!("LANGUAGE={language}"));
        }
        if let Some(name) = &self.config.bot_name {
            env.push(format!("BOT_NAME={name}"));
        }
        env
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start the bot container; returns the container id.
    async fn launch(&self, spec: &LaunchSpec) -> Result<String>;

    /// Ask the container to exit, giving it `grace` before SIGKILL.
    async fn signal_stop(&self, container_name: &str, grace: Duration) -> Result<()>;

    /// Remove the container, killing it if necessary. Missing containers
    /// are not an error.
    async fn force_remove(&self, container_name: &str) -> Result<()>;

    /// Whether the container exists and is running.
    async fn is_running(&self, container_name: &str) -> Result<bool>;

    /// Daemon connectivity check.
    async fn ping(&self) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Docker implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DockerRuntime {
    docker: Docker,
    image: String,
    network: Option<String>,
}

impl DockerRuntime {
    pub fn connect(config: &DockerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Runtime(format!("connecting to Docker: {e}")))?;
        Ok(Self {
            docker,
            image: config.image.clone(),
            network: config.network.clone(),
        })
    }
}

fn runtime_err(e: bollard::errors::Error) -> Error {
    Error::Runtime(e.to_string())
}

fn is_404(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.container_name.as_str(),
            platform: None,
        };
        let config = ContainerConfig {
            image: Some(self.image.clone()),
            env: Some(spec.env()),
            host_config: Some(HostConfig {
                network_mode: self.network.clone(),
                ..Default::default()
            }),
            labels: Some(
                [
                    ("stenobot.meeting_id".to_string(), spec.meeting_id.to_string()),
                    ("stenobot.platform".to_string(), spec.platform.to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(runtime_err)?;
        self.docker
            .start_container::<String>(&spec.container_name, None)
            .await
            .map_err(runtime_err)?;

        tracing::info!(
            container_id = %created.id,
            container_name = %spec.container_name,
            meeting_id = %spec.meeting_id,
            "bot container started"
        );
        Ok(created.id)
    }

    async fn signal_stop(&self, container_name: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(container_name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_404(&e) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn force_remove(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_404(&e) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn is_running(&self, container_name: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(e) if is_404(&e) => Ok(false),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(runtime_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_spec_env_includes_required_vars() {
        let spec = LaunchSpec {
            container_name: "stenobot-test".into(),
            meeting_id: Uuid::new_v4(),
            platform: Platform::GoogleMeet,
            native_meeting_id: "abc-defg-hij".into(),
            passcode: Some("1234".into()),
            config: BotConfig {
                language: Some("en".into()),
                bot_name: Some("Notetaker".into()),
                ..Default::default()
            },
            bot_token: "t0k3n".into(),
            callback_url: "http://gateway:8056/internal/status_change".into(),
            allocator_url: "http://gateway:8056/internal/allocate".into(),
        };

        let env = spec.env();
        assert!(env.iter().any(|e| e == "PLATFORM=google_meet"));
        assert!(env.iter().any(|e| e == "NATIVE_MEETING_ID=abc-defg-hij"));
        assert!(env.iter().any(|e| e == "MEETING_PASSCODE=1234"));
        assert!(env.iter().any(|e| e == "LANGUAGE=en"));
        assert!(env.iter().any(|e| e == "BOT_NAME=Notetaker"));
        assert!(env.iter().any(|e| e == "TASK=transcribe"));
        assert!(env.iter().any(|e| e.starts_with("MEETING_ID=")));
        assert!(env.iter().any(|e| e.starts_with("BOT_TOKEN=")));
    }

    #[test]
    fn launch_spec_env_omits_absent_options() {
        let spec = LaunchSpec {
            container_name: "stenobot-test".into(),
            meeting_id: Uuid::new_v4(),
            platform: Platform::Teams,
            native_meeting_id: "xyz".into(),
            passcode: None,
            config: BotConfig::default(),
            bot_token: "t".into(),
            callback_url: "http://g/cb".into(),
            allocator_url: "http://g/alloc".into(),
        };
        let env = spec.env();
        assert!(!env.iter().any(|e| e.starts_with("MEETING_PASSCODE=")));
        assert!(!env.iter().any(|e| e.starts_with("LANGUAGE=")));
        assert!(!env.iter().any(|e| e.starts_with("BOT_NAME=")));
    }
}
