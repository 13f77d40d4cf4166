//! Generic JSON webhook channel.
//!
//! Posts the serialized [`NotifyEvent`] as-is, so a downstream push gateway
//! (SMS, mobile push, radio dispatch) can route on `type` and `guard_id`.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for the webhook URL.
const ENV_NOTIFY_WEBHOOK_URL: &str = "NOTIFY_WEBHOOK_URL";

/// Per-request timeout for webhook delivery.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON webhook notification channel.
pub struct WebhookChannel {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a new webhook channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_url(std::env::var(ENV_NOTIFY_WEBHOOK_URL).ok())
    }

    /// Create a webhook channel posting to `url`.
    #[must_use]
    pub fn new(url: String) -> Self {
        Self::with_url(Some(url))
    }

    fn with_url(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { url, client }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_NOTIFY_WEBHOOK_URL.to_string()))?;

        let response = self.client.post(url).json(event).send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(channel = "webhook", guard_id = ?event.guard_id(), "Notification sent");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(channel = "webhook", status = %status, "Webhook request failed");
        Err(ChannelError::Rejected {
            channel: "webhook",
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_tagged_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "type": "assignment_created",
                "guard_id": "g-1",
                "date": "2026-03-02"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WebhookChannel::new(server.uri());
        let event = NotifyEvent::AssignmentCreated {
            guard_id: "g-1".to_string(),
            round_name: "Perimeter".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            start_time: "22:00".to_string(),
            end_time: "06:00".to_string(),
            timestamp: chrono::Utc::now(),
        };
        channel.send(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_unconfigured_channel_fails() {
        let channel = WebhookChannel::with_url(None);
        assert!(!channel.enabled());
        let event = NotifyEvent::GuardMessage {
            guard_id: "g-1".to_string(),
            message: "hello".to_string(),
            timestamp: chrono::Utc::now(),
        };
        assert!(matches!(
            channel.send(&event).await,
            Err(ChannelError::NotConfigured(_))
        ));
    }
}
