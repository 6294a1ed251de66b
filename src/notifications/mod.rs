//! Success notifications
//!
//! When a run reaches SUCCEEDED the scheduler hands a [`SuccessEvent`] to the
//! configured [`Notifier`]. Delivery happens on a spawned task; a failed
//! delivery is logged and never affects the run.

pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::{SlotTime, TargetKey};

pub use webhook::{WebhookConfig, WebhookNotifier};

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur while delivering a notification
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Invalid channel configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Receiver answered with a non-success status
    #[error("Rejected with status {0}")]
    Rejected(u16),
}

/// Response from sending a notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub success: bool,
    pub channel: String,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryStatus {
    pub fn success(channel: impl Into<String>) -> Self {
        Self {
            success: true,
            channel: channel.into(),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            channel: channel.into(),
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "SUCCESS" } else { "FAILED" };
        write!(f, "[{status}] {}", self.channel)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// Destination for operator notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver a plain-text message
    async fn send(&self, content: &str) -> ChannelResult<DeliveryStatus>;
}

/// A run that won its slot
#[derive(Debug, Clone)]
pub struct SuccessEvent {
    pub run_id: Uuid,
    pub key: TargetKey,
    pub slot: SlotTime,
    pub sequence: u32,
    pub at: DateTime<Utc>,
}

impl SuccessEvent {
    pub fn render(&self) -> String {
        format!(
            "Reservation succeeded: {} ({}) on {} at {} via channel {} (attempt #{}, {}, run {})",
            self.key.pavilion_id,
            self.key.event_code,
            self.key.date.format("%Y-%m-%d"),
            self.slot,
            self.key.channel,
            self.sequence,
            self.at.format("%H:%M:%S%.3f UTC"),
            self.run_id,
        )
    }
}
