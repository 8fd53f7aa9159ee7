//! Outbound webhook dispatch after a meeting reaches a terminal state.
//!
//! Delivery is best-effort with bounded retries; failures are logged and
//! never block or fail the status update that triggered them.

use std::time::Duration;

use sb_domain::config::WebhookConfig;
use sb_domain::Meeting;

#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    attempts: u32,
    backoff: Duration,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, config: &WebhookConfig) -> Self {
        Self {
            client,
            attempts: config.attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// POST the final meeting record to the meeting's webhook URL, if one
    /// is configured.
    pub async fn dispatch(&self, meeting: &Meeting) {
        let Some(url) = meeting.config.webhook_url.clone() else {
            return;
        };

        for attempt in 1..=self.attempts {
            let result = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .json(meeting)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(
                        meeting_id = %meeting.meeting_id,
                        url = %url,
                        attempt,
                        "webhook delivered"
                    );
                    return;
                }
                Ok(resp) => {
                    tracing::warn!(
                        meeting_id = %meeting.meeting_id,
                        url = %url,
                        attempt,
                        status = %resp.status(),
                        "webhook rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        meeting_id = %meeting.meeting_id,
                        url = %url,
                        attempt,
                        error = %e,
                        "webhook request failed"
                    );
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.backoff * attempt).await;
            }
        }

        tracing::error!(
            meeting_id = %meeting.meeting_id,
            url = %url,
            attempts = self.attempts,
            "webhook delivery abandoned"
        );
    }
}
