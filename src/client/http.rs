//! HTTP implementation of the endpoint traits
//!
//! One `reqwest` client serves all four endpoints. Requests are never
//! retried here: retry cadence belongs to the poller and the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{header::DATE, Client};
use std::time::Duration;

use super::headers::build_api_headers;
use super::{
    AvailabilityFeed, FetchError, RawResponse, ReservationEndpoint, ReservationPayload,
    ServerTimeSource, SessionProbe,
};
use crate::config::EndpointConfig;
use crate::models::{Session, Target};

/// The `Date` header has one-second resolution; the true server time lies
/// uniformly within the following second.
const DATE_HEADER_MIDPOINT_MS: i64 = 500;

/// HTTP client for the ticketing API
pub struct TicketApi {
    client: Client,
    config: EndpointConfig,
}

impl TicketApi {
    /// Create a client from endpoint configuration
    ///
    /// # Errors
    ///
    /// Returns `FetchError` if the HTTP client cannot be created
    pub fn new(config: EndpointConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .gzip(true)
            .build()?;

        Ok(Self { client, config })
    }

    /// Create a client pointing every endpoint at `base_url`, for mock servers
    ///
    /// # Errors
    ///
    /// Returns `FetchError` if the HTTP client cannot be created
    pub fn with_base_url(base_url: &str) -> Result<Self, FetchError> {
        let config = EndpointConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            availability_base_url: None,
            ..EndpointConfig::default()
        };
        Self::new(config)
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn availability_url(&self, target: &Target) -> String {
        let base = self
            .config
            .availability_base_url
            .as_deref()
            .unwrap_or(&self.config.base_url)
            .trim_end_matches('/');
        let path = self
            .config
            .availability_path
            .replace("{event_code}", &target.event_code);
        format!("{base}{path}")
    }

    async fn into_raw(response: reqwest::Response) -> Result<RawResponse, FetchError> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(RawResponse { status, body })
    }
}

#[async_trait]
impl AvailabilityFeed for TicketApi {
    async fn fetch_availability(
        &self,
        target: &Target,
        session: Option<&Session>,
    ) -> Result<RawResponse, FetchError> {
        let headers = build_api_headers(
            &self.config.user_agent,
            &self.config.api_lang,
            session.map(|s| s.token.as_str()),
        )?;

        let mut query: Vec<(&str, String)> = target
            .ticket_ids
            .iter()
            .map(|id| ("ticket_ids[]", id.trim().to_string()))
            .collect();
        query.push(("entrance_date", target.entrance_date()));
        query.push(("channel", target.channel.to_string()));

        let response = self
            .client
            .get(self.availability_url(target))
            .headers(headers)
            .query(&query)
            .send()
            .await?;

        Self::into_raw(response).await
    }
}

#[async_trait]
impl ReservationEndpoint for TicketApi {
    async fn post_reservation(
        &self,
        payload: &ReservationPayload,
        session: &Session,
    ) -> Result<RawResponse, FetchError> {
        let headers = build_api_headers(
            &self.config.user_agent,
            &self.config.api_lang,
            Some(&session.token),
        )?;

        let response = self
            .client
            .post(self.url(&self.config.reservation_path))
            .headers(headers)
            .json(payload)
            .send()
            .await?;

        Self::into_raw(response).await
    }
}

#[async_trait]
impl ServerTimeSource for TicketApi {
    async fn server_time(&self) -> Result<DateTime<Utc>, FetchError> {
        let response = self
            .client
            .head(self.url(&self.config.clock_path))
            .header(reqwest::header::USER_AGENT, &self.config.user_agent)
            .send()
            .await?;

        let raw = response
            .headers()
            .get(DATE)
            .ok_or_else(|| FetchError::InvalidHeader("missing Date header".to_string()))?
            .to_str()
            .map_err(|e| FetchError::InvalidHeader(e.to_string()))?;

        parse_http_date(raw)
    }
}

#[async_trait]
impl SessionProbe for TicketApi {
    async fn check_session(&self, session: &Session) -> Result<u16, FetchError> {
        let headers = build_api_headers(
            &self.config.user_agent,
            &self.config.api_lang,
            Some(&session.token),
        )?;

        let response = self
            .client
            .get(self.url(&self.config.session_check_path))
            .headers(headers)
            .send()
            .await?;

        Ok(response.status().as_u16())
    }
}

/// Parse an RFC 7231 `Date` header into the midpoint of its second
pub fn parse_http_date(raw: &str) -> Result<DateTime<Utc>, FetchError> {
    let parsed = DateTime::parse_from_rfc2822(raw.trim())
        .map_err(|e| FetchError::Decode(format!("invalid Date header '{raw}': {e}")))?;
    Ok(parsed.with_timezone(&Utc) + TimeDelta::milliseconds(DATE_HEADER_MIDPOINT_MS))
}
