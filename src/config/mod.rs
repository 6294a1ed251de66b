//! Configuration management for slotrush
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Every section has defaults, so a file only needs
//! to name the values it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote endpoints and HTTP client settings
    pub endpoints: EndpointConfig,

    /// Availability polling
    pub poller: PollerConfig,

    /// Run timing and burst cadence
    pub scheduler: SchedulerConfig,

    /// Clock offset measurement
    pub clock: ClockConfig,

    /// Session credential handling
    pub session: SessionConfig,

    /// Success notifications
    pub notifications: NotificationConfig,

    /// Per-pavilion slot label adjustments
    pub adjustments: AdjustmentConfig,

    /// Local control interface
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Remote endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Base URL of the ticketing API
    pub base_url: String,

    /// Base URL of the availability feed, defaults to `base_url`
    pub availability_base_url: Option<String>,

    /// Availability path; `{event_code}` is substituted
    pub availability_path: String,

    /// Reservation POST path
    pub reservation_path: String,

    /// Account info path used to validate a session
    pub session_check_path: String,

    /// Path probed for the server `Date` header
    pub clock_path: String,

    /// User agent string
    pub user_agent: String,

    /// Value of the `x-api-lang` header
    pub api_lang: String,

    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,
}

/// Availability poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Base poll interval in milliseconds
    pub interval_ms: u64,

    /// Upper bound for the backed-off interval in milliseconds
    pub backoff_cap_ms: u64,

    /// Consecutive 429/403 responses before the interval doubles
    pub throttle_threshold: u32,

    /// Free capacity below this count classifies as LIMITED
    pub low_water: u32,
}

/// Run and burst configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Burst window for scheduled runs in seconds
    pub scheduled_window_secs: u64,

    /// Burst window for availability-triggered runs in seconds
    pub availability_window_secs: u64,

    /// Fixed delay between attempts in milliseconds
    pub attempt_interval_ms: u64,

    /// Random extra delay added to each interval, up to this many milliseconds
    pub attempt_jitter_ms: u64,

    /// Consecutive SLOT_TAKEN outcomes that exhaust a run; unset keeps going
    pub max_consecutive_slot_taken: Option<u32>,

    /// How long a burst waits for a fresh session after an auth failure
    pub auth_resume_timeout_secs: u64,

    /// Lead time before the scheduled instant when WAITING begins
    pub prefire_lead_ms: u64,

    /// Sleep granularity while WAITING
    pub wait_granularity_ms: u64,

    /// Poll samples retained per run
    pub sample_history_limit: usize,

    /// Finished runs kept for status and export
    pub max_finished_runs: usize,
}

/// Clock offset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Probes per measurement; the lowest round trip wins
    pub samples: u32,

    /// Offset change that logs a drift warning, in milliseconds
    pub drift_warn_ms: i64,

    /// Age after which a measurement reads as stale, in seconds
    pub stale_after_secs: u64,

    /// Background re-measurement interval; unset measures on demand only
    pub refresh_interval_secs: Option<u64>,

    /// Re-measure when a scheduled run enters WAITING
    pub remeasure_before_fire: bool,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// File holding the session cookie written by the login collaborator
    pub credential_file: PathBuf,

    /// Validity check interval in seconds
    pub check_interval_secs: u64,

    /// Assumed token lifetime in seconds
    pub token_lifetime_secs: u64,

    /// Remaining lifetime that counts as expiring, in seconds
    pub expiry_margin_secs: u64,

    /// External command that renews the credential file
    pub refresh_command: Option<Vec<String>>,

    /// Timeout for the refresh command in seconds
    pub refresh_timeout_secs: u64,

    /// Invalid-session events retained
    pub invalid_log_limit: usize,
}

/// Notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Webhook receiving success messages
    pub webhook_url: Option<String>,

    /// Sender name shown by the webhook receiver
    pub username: String,

    /// Delivery timeout in seconds
    pub timeout_secs: u64,
}

/// Slot adjustment configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdjustmentConfig {
    /// JSON map of pavilion id to minute offset
    pub file: Option<PathBuf>,
}

/// Control interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: SocketAddr,

    /// Enable CORS
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,

    /// Attempts returned by run detail when no limit is given
    pub default_attempt_limit: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://ticket.expo2025.or.jp"),
            availability_base_url: None,
            availability_path: String::from("/api/d/events/{event_code}"),
            reservation_path: String::from("/api/d/user_event_reservations"),
            session_check_path: String::from("/api/d/account/info"),
            clock_path: String::from("/"),
            user_agent: String::from(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            ),
            api_lang: String::from("ja"),
            request_timeout_ms: 5000,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            backoff_cap_ms: 60_000,
            throttle_threshold: 2,
            low_water: 3,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduled_window_secs: 60,
            availability_window_secs: 60,
            attempt_interval_ms: 500,
            attempt_jitter_ms: 0,
            max_consecutive_slot_taken: None,
            auth_resume_timeout_secs: 120,
            prefire_lead_ms: 3000,
            wait_granularity_ms: 5,
            sample_history_limit: 500,
            max_finished_runs: 50,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            samples: 3,
            drift_warn_ms: 250,
            stale_after_secs: 1800,
            refresh_interval_secs: None,
            remeasure_before_fire: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_file: PathBuf::from("cookie.txt"),
            check_interval_secs: 300,
            token_lifetime_secs: 3600,
            expiry_margin_secs: 300,
            refresh_command: None,
            refresh_timeout_secs: 120,
            invalid_log_limit: 100,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            username: String::from("slotrush"),
            timeout_secs: 5,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 5000)),
            enable_cors: true,
            enable_request_logging: true,
            default_attempt_limit: 20,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(base_url) = std::env::var("SLOTRUSH_BASE_URL") {
            config.endpoints.base_url = base_url;
        }
        if let Ok(url) = std::env::var("SLOTRUSH_AVAILABILITY_BASE_URL") {
            config.endpoints.availability_base_url = Some(url);
        }
        if let Some(timeout) = env_parse("SLOTRUSH_REQUEST_TIMEOUT_MS") {
            config.endpoints.request_timeout_ms = timeout;
        }
        if let Some(interval) = env_parse("SLOTRUSH_POLL_INTERVAL_MS") {
            config.poller.interval_ms = interval;
        }
        if let Some(interval) = env_parse("SLOTRUSH_ATTEMPT_INTERVAL_MS") {
            config.scheduler.attempt_interval_ms = interval;
        }
        if let Some(window) = env_parse("SLOTRUSH_WINDOW_SECS") {
            config.scheduler.scheduled_window_secs = window;
            config.scheduler.availability_window_secs = window;
        }
        if let Some(lead) = env_parse("SLOTRUSH_PREFIRE_LEAD_MS") {
            config.scheduler.prefire_lead_ms = lead;
        }
        if let Ok(path) = std::env::var("SLOTRUSH_CREDENTIAL_FILE") {
            config.session.credential_file = PathBuf::from(path);
        }
        if let Ok(command) = std::env::var("SLOTRUSH_REFRESH_COMMAND") {
            let parts: Vec<String> = command.split_whitespace().map(String::from).collect();
            config.session.refresh_command = (!parts.is_empty()).then_some(parts);
        }
        if let Ok(url) = std::env::var("SLOTRUSH_WEBHOOK_URL") {
            config.notifications.webhook_url = Some(url);
        }
        if let Ok(path) = std::env::var("SLOTRUSH_ADJUSTMENTS_FILE") {
            config.adjustments.file = Some(PathBuf::from(path));
        }
        if let Some(addr) = env_parse("SLOTRUSH_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }
        if let Ok(level) = std::env::var("SLOTRUSH_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("SLOTRUSH_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from a file when given, otherwise from the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.endpoints.base_url.starts_with("http://")
            && !self.endpoints.base_url.starts_with("https://")
        {
            anyhow::bail!("base_url must start with http:// or https://");
        }

        if self.endpoints.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than 0");
        }

        if self.poller.interval_ms == 0 {
            anyhow::bail!("poller interval_ms must be greater than 0");
        }

        if self.poller.backoff_cap_ms < self.poller.interval_ms {
            anyhow::bail!("poller backoff_cap_ms must not be below interval_ms");
        }

        if self.poller.throttle_threshold == 0 {
            anyhow::bail!("poller throttle_threshold must be greater than 0");
        }

        if self.scheduler.scheduled_window_secs == 0 || self.scheduler.availability_window_secs == 0 {
            anyhow::bail!("burst windows must be greater than 0");
        }

        if self.scheduler.wait_granularity_ms == 0 {
            anyhow::bail!("wait_granularity_ms must be greater than 0");
        }

        if self.scheduler.max_consecutive_slot_taken == Some(0) {
            anyhow::bail!("max_consecutive_slot_taken must be greater than 0 when set");
        }

        if self.clock.samples == 0 {
            anyhow::bail!("clock samples must be greater than 0");
        }

        if self.session.check_interval_secs == 0 {
            anyhow::bail!("session check_interval_secs must be greater than 0");
        }

        if let Some(command) = &self.session.refresh_command {
            if command.is_empty() {
                anyhow::bail!("session refresh_command must not be empty when set");
            }
        }

        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.endpoints.request_timeout_ms)
    }
}

impl PollerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn scheduled_window(&self) -> Duration {
        Duration::from_secs(self.scheduled_window_secs)
    }

    #[must_use]
    pub fn availability_window(&self) -> Duration {
        Duration::from_secs(self.availability_window_secs)
    }

    #[must_use]
    pub fn attempt_interval(&self) -> Duration {
        Duration::from_millis(self.attempt_interval_ms)
    }

    #[must_use]
    pub fn auth_resume_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_resume_timeout_secs)
    }

    #[must_use]
    pub fn prefire_lead(&self) -> Duration {
        Duration::from_millis(self.prefire_lead_ms)
    }

    #[must_use]
    pub fn wait_granularity(&self) -> Duration {
        Duration::from_millis(self.wait_granularity_ms)
    }
}

impl ClockConfig {
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs.map(Duration::from_secs)
    }
}

impl SessionConfig {
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    #[must_use]
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    #[must_use]
    pub fn expiry_margin(&self) -> Duration {
        Duration::from_secs(self.expiry_margin_secs)
    }

    #[must_use]
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_backoff_cap() {
        let mut config = Config::default();
        config.poller.backoff_cap_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_slot_taken_limit_rejected() {
        let mut config = Config::default();
        config.scheduler.max_consecutive_slot_taken = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_timeout_conversion() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.scheduler.scheduled_window(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [scheduler]
            attempt_interval_ms = 1000
            max_consecutive_slot_taken = 30

            [session]
            refresh_command = ["python", "autologin.py", "--silent"]
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.attempt_interval_ms, 1000);
        assert_eq!(config.scheduler.max_consecutive_slot_taken, Some(30));
        assert_eq!(config.scheduler.scheduled_window_secs, 60);
        assert_eq!(config.poller.interval_ms, 2000);
        assert_eq!(config.session.refresh_command.as_ref().map(Vec::len), Some(3));
        assert!(config.validate().is_ok());
    }
}
