//! Endpoint client for the ticketing API
//!
//! The engine talks to four remote endpoints. Each one sits behind a small
//! async trait so the scheduler can be driven by in-memory fakes while
//! [`TicketApi`] provides the HTTP implementation:
//!
//! - [`AvailabilityFeed`] - slot status GET
//! - [`ReservationEndpoint`] - reservation POST
//! - [`ServerTimeSource`] - authoritative clock probe
//! - [`SessionProbe`] - session validity check
//!
//! Feed and reservation calls return the raw status and body for every HTTP
//! response; only transport failures become [`FetchError`].

pub mod headers;
pub mod http;

pub use http::TicketApi;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Session, SlotTime, Target};

/// Errors that can occur while talking to an endpoint
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error not covered by a more specific variant
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Unexpected status code
    #[error("Unexpected status: {0}")]
    Status(u16),

    /// Header could not be built or read
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Content decoding error
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_builder() {
            Self::InvalidUrl(err.to_string())
        } else {
            Self::Http(err)
        }
    }
}

impl FetchError {
    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout | Self::Connect(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
            Self::InvalidHeader(_) | Self::Decode(_) | Self::InvalidUrl(_) => false,
        }
    }
}

/// Status code and body of an HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// JSON body of a reservation POST
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationPayload {
    pub ticket_ids: Vec<String>,
    pub entrance_date: String,
    pub start_time: String,
    pub event_code: String,
    pub registered_channel: String,
}

impl ReservationPayload {
    /// Payload requesting `slot` for `target`
    pub fn for_target(target: &Target, slot: SlotTime) -> Self {
        Self {
            ticket_ids: target
                .ticket_ids
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            entrance_date: target.entrance_date(),
            start_time: slot.as_hhmm(),
            event_code: target.event_code.clone(),
            registered_channel: target.channel.to_string(),
        }
    }
}

/// Slot status feed
#[async_trait]
pub trait AvailabilityFeed: Send + Sync {
    async fn fetch_availability(
        &self,
        target: &Target,
        session: Option<&Session>,
    ) -> Result<RawResponse, FetchError>;
}

/// Reservation submission endpoint
#[async_trait]
pub trait ReservationEndpoint: Send + Sync {
    async fn post_reservation(
        &self,
        payload: &ReservationPayload,
        session: &Session,
    ) -> Result<RawResponse, FetchError>;
}

/// Source of the authoritative server time
#[async_trait]
pub trait ServerTimeSource: Send + Sync {
    async fn server_time(&self) -> Result<DateTime<Utc>, FetchError>;
}

/// Session validity check, returns the HTTP status
#[async_trait]
pub trait SessionProbe: Send + Sync {
    async fn check_session(&self, session: &Session) -> Result<u16, FetchError>;
}
