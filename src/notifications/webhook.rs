//! Webhook notifier
//!
//! Posts a Discord-compatible `{"content": ..., "username": ...}` JSON body.
//! Any 2xx answer counts as delivered.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChannelError, ChannelResult, DeliveryStatus, Notifier};
use crate::config::NotificationConfig;

/// Webhook channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Display name shown by the receiving chat service
    pub username: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    5
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: "slotrush".to_string(),
            timeout_secs: default_timeout(),
        }
    }

    /// Build from the notification section, `None` when no URL is set
    pub fn from_config(config: &NotificationConfig) -> Option<Self> {
        let url = config.webhook_url.as_ref().filter(|u| !u.trim().is_empty())?;
        Some(Self {
            url: url.clone(),
            username: config.username.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Webhook URL cannot be empty".to_string());
        }

        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err("Webhook URL must start with http:// or https://".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Sends notifications to a chat webhook
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::InvalidConfig)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn build_payload(&self, content: &str) -> serde_json::Value {
        serde_json::json!({
            "content": content,
            "username": self.config.username,
        })
    }

    async fn deliver(&self, payload: &serde_json::Value) -> ChannelResult<()> {
        let response = self.client.post(&self.config.url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ChannelError::Rejected(status.as_u16()))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, content: &str) -> ChannelResult<DeliveryStatus> {
        let payload = self.build_payload(content);

        match self.deliver(&payload).await {
            Ok(()) => {
                tracing::info!(url = %self.config.url, "Webhook notification delivered");
                Ok(DeliveryStatus::success(self.name()))
            }
            Err(e) => {
                tracing::error!(url = %self.config.url, error = %e, "Webhook notification failed");
                Ok(DeliveryStatus::failure(self.name(), e.to_string()))
            }
        }
    }
}
