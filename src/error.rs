//! Unified error handling for the slotrush crate
//!
//! Domain modules define their own error enums; this module folds them into a
//! single [`Error`] and classifies every failure into an [`ErrorClass`] so the
//! scheduler and the control interface can report it uniformly.
//!
//! # Architecture
//!
//! - [`SlotrushErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorClass`] - Failure taxonomy shared by runs, samples and attempts
//! - [`Error`] - Unified error enum wrapping all domain-specific errors

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::client::FetchError;
pub use crate::notifications::ChannelError;
pub use crate::scheduler::error::RunError;
pub use crate::session::SessionError;

/// Common trait for all slotrush error types
pub trait SlotrushErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error class for handling strategies
    fn class(&self) -> ErrorClass;
}

/// Failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection failures, timeouts, throttling and 5xx
    Network,
    /// Request rejected by endpoint validation; retrying cannot help
    Parameter,
    /// Session expired or rejected
    Auth,
    /// Slot already consumed; the steady state of a race
    SlotTaken,
    /// Clock offset moved more than the warning threshold
    ClockDrift,
    /// Invalid configuration or target
    Config,
    /// Local file or export failures
    Storage,
    /// Anything else
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Parameter => "parameter",
            Self::Auth => "auth",
            Self::SlotTaken => "slot_taken",
            Self::ClockDrift => "clock_drift",
            Self::Config => "config",
            Self::Storage => "storage",
            Self::Other => "other",
        }
    }

    /// Whether the same request may succeed if issued again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::SlotTaken | Self::Auth | Self::ClockDrift)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the slotrush crate
#[derive(Error, Debug)]
pub enum Error {
    /// Endpoint transport errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Session and credential errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Run lifecycle errors
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// Notification delivery errors
    #[error("Notification error: {0}")]
    Channel(#[from] ChannelError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV export errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SlotrushErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::Run(e) => e.is_recoverable(),
            Self::Channel(_) => true,
            Self::Io(_) => true,
            Self::Json(_) | Self::Csv(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn class(&self) -> ErrorClass {
        match self {
            Self::Fetch(_) | Self::Channel(_) => ErrorClass::Network,
            Self::Session(_) => ErrorClass::Auth,
            Self::Run(e) => e.class(),
            Self::Io(_) | Self::Csv(_) => ErrorClass::Storage,
            Self::Json(_) => ErrorClass::Other,
            Self::Config(_) => ErrorClass::Config,
            Self::Other { .. } => ErrorClass::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_is_not_recoverable() {
        let err = Error::config("bad bind address");
        assert!(!err.is_recoverable());
        assert_eq!(err.class(), ErrorClass::Config);
        assert_eq!(err.to_string(), "Config error: bad bind address");
    }

    #[test]
    fn test_fetch_timeout_is_network() {
        let err: Error = FetchError::Timeout.into();
        assert!(err.is_recoverable());
        assert_eq!(err.class(), ErrorClass::Network);
    }

    #[test]
    fn test_with_source_keeps_chain() {
        let io = io::Error::new(io::ErrorKind::NotFound, "cookie.txt");
        let err = Error::with_source("loading credentials", io);
        assert_eq!(err.to_string(), "loading credentials");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_class_retryable() {
        assert!(ErrorClass::Network.is_retryable());
        assert!(ErrorClass::SlotTaken.is_retryable());
        assert!(!ErrorClass::Parameter.is_retryable());
        assert!(!ErrorClass::Config.is_retryable());
        assert_eq!(serde_json::to_string(&ErrorClass::SlotTaken).unwrap(), "\"slot_taken\"");
    }
}
