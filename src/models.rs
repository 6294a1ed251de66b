//! Core data structures for reservation targets, samples and attempts
//!
//! These types are shared by the poller, the submission path, the scheduler
//! and the control interface. Wire formats follow the ticketing API:
//! dates travel as `YYYYMMDD` and slot times as `HHMM`.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ErrorClass;

/// Highest registration channel number accepted by the ticketing API
pub const MAX_CHANNEL: u8 = 5;

// ============================================================================
// Slot Time
// ============================================================================

/// Error returned when a slot label cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid slot time '{0}', expected HHMM or HH:MM")]
pub struct SlotTimeParseError(pub String);

/// Wall-clock slot label (`HHMM`), stored as minutes since midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotTime {
    minutes: u16,
}

impl SlotTime {
    const MINUTES_PER_DAY: i32 = 24 * 60;

    /// Build a slot time from hour and minute, `None` when out of range
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour >= 24 || minute >= 60 {
            return None;
        }
        Some(Self {
            minutes: u16::from(hour) * 60 + u16::from(minute),
        })
    }

    pub fn hour(&self) -> u8 {
        (self.minutes / 60) as u8
    }

    pub fn minute(&self) -> u8 {
        (self.minutes % 60) as u8
    }

    /// Shift by a signed number of minutes, wrapping around midnight
    #[must_use]
    pub fn shift_minutes(self, delta: i32) -> Self {
        let total = (i32::from(self.minutes) + delta).rem_euclid(Self::MINUTES_PER_DAY);
        Self {
            minutes: total as u16,
        }
    }

    /// Four-digit wire label
    pub fn as_hhmm(&self) -> String {
        format!("{:02}{:02}", self.hour(), self.minute())
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for SlotTime {
    type Err = SlotTimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits: String = trimmed.chars().filter(|c| *c != ':').collect();
        let colon_ok = !trimmed.contains(':') || trimmed.find(':') == Some(2);

        if digits.len() != 4 || !colon_ok || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(SlotTimeParseError(s.to_string()));
        }

        let hour = digits[..2].parse::<u8>().map_err(|_| SlotTimeParseError(s.to_string()))?;
        let minute = digits[2..].parse::<u8>().map_err(|_| SlotTimeParseError(s.to_string()))?;

        Self::new(hour, minute).ok_or_else(|| SlotTimeParseError(s.to_string()))
    }
}

impl TryFrom<String> for SlotTime {
    type Error = SlotTimeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SlotTime> for String {
    fn from(value: SlotTime) -> Self {
        value.as_hhmm()
    }
}

// ============================================================================
// Target
// ============================================================================

/// Compact `YYYYMMDD` date format, also accepting ISO dates on input
pub mod compact_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y%m%d";

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<NaiveDate, String> {
        NaiveDate::parse_from_str(raw, FORMAT)
            .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
            .map_err(|_| format!("invalid date '{raw}', expected YYYYMMDD"))
    }
}

/// Validation failures for a target, raised before a run is armed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("channel {0} is out of range (0-{max})", max = MAX_CHANNEL)]
    InvalidChannel(u8),
}

/// A reservation target: which slot to race for and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Venue identifier used by the availability feed
    pub pavilion_id: String,

    /// Visit date
    #[serde(with = "compact_date")]
    pub date: NaiveDate,

    /// Event identifier used by the reservation endpoint
    pub event_code: String,

    /// Registration channel
    pub channel: u8,

    /// Authoritative-clock instant to fire at; `None` fires on availability
    #[serde(default)]
    pub scheduled_instant: Option<DateTime<Utc>>,

    /// Ticket identifiers submitted with every reservation
    pub ticket_ids: Vec<String>,

    /// Slot to request; availability runs may leave this to the feed
    #[serde(default)]
    pub start_time: Option<SlotTime>,
}

impl Target {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            event_code: self.event_code.clone(),
            pavilion_id: self.pavilion_id.clone(),
            date: self.date,
            start_time: self.start_time,
            channel: self.channel,
        }
    }

    /// `YYYYMMDD` form of the visit date
    pub fn entrance_date(&self) -> String {
        self.date.format(compact_date::FORMAT).to_string()
    }

    /// Check that every field the endpoints need is present
    pub fn validate(&self, require_start_time: bool) -> Result<(), TargetError> {
        if self.pavilion_id.trim().is_empty() {
            return Err(TargetError::MissingField("pavilion_id"));
        }
        if self.event_code.trim().is_empty() {
            return Err(TargetError::MissingField("event_code"));
        }
        if self.ticket_ids.iter().all(|t| t.trim().is_empty()) {
            return Err(TargetError::MissingField("ticket_ids"));
        }
        if self.channel > MAX_CHANNEL {
            return Err(TargetError::InvalidChannel(self.channel));
        }
        if require_start_time && self.start_time.is_none() {
            return Err(TargetError::MissingField("start_time"));
        }
        Ok(())
    }
}

/// Identity of a target for the one-active-run rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub event_code: String,
    pub pavilion_id: String,
    #[serde(with = "compact_date")]
    pub date: NaiveDate,
    pub start_time: Option<SlotTime>,
    pub channel: u8,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self
            .start_time
            .map(|s| s.as_hhmm())
            .unwrap_or_else(|| "any".to_string());
        write!(
            f,
            "{}/{}@{}#{}/ch{}",
            self.pavilion_id,
            self.event_code,
            self.date.format(compact_date::FORMAT),
            slot,
            self.channel
        )
    }
}

// ============================================================================
// Trigger Modes
// ============================================================================

/// How a run decides when to start bursting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "at", rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fire at a fixed authoritative-clock instant
    Scheduled(DateTime<Utc>),
    /// Fire once the poller reports OPEN or LIMITED
    OnAvailability,
    /// Fire now and keep going until stopped
    Immediate,
}

impl TriggerMode {
    /// Derive the mode from a target and the operator's manual flag
    pub fn for_target(target: &Target, manual: bool) -> Self {
        if manual {
            Self::Immediate
        } else {
            match target.scheduled_instant {
                Some(at) => Self::Scheduled(at),
                None => Self::OnAvailability,
            }
        }
    }

    /// Whether the target must name its slot up front
    pub fn requires_start_time(&self) -> bool {
        !matches!(self, Self::OnAvailability)
    }
}

/// Burst duration policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    Bounded(Duration),
    Unbounded,
}

impl WindowPolicy {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Bounded(d) => Some(*d),
            Self::Unbounded => None,
        }
    }
}

// ============================================================================
// Samples and Attempts
// ============================================================================

/// Availability classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollStatus {
    Open,
    Limited,
    Closed,
    Unknown,
}

impl PollStatus {
    /// OPEN and LIMITED both trigger a burst
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Open | Self::Limited)
    }

    /// Ordering used to pick the best slot in a feed response
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Open => 3,
            Self::Limited => 2,
            Self::Closed => 1,
            Self::Unknown => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Limited => "LIMITED",
            Self::Closed => "CLOSED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of the availability feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSample {
    pub timestamp: DateTime<Utc>,
    pub target: TargetKey,
    pub status: PollStatus,
    /// Best matching slot in the response
    pub slot_time: Option<SlotTime>,
    /// Free capacity of that slot when the feed reports counts
    pub capacity: Option<u32>,
    pub http_status: Option<u16>,
    pub error: Option<ErrorClass>,
}

/// Classified result of one reservation POST
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    SlotTaken,
    ParameterError,
    NetworkError,
    AuthError,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::SlotTaken => "SLOT_TAKEN",
            Self::ParameterError => "PARAMETER_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::AuthError => "AUTH_ERROR",
        }
    }

    /// Error class to surface on the run, `None` for success
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Success => None,
            Self::SlotTaken => Some(ErrorClass::SlotTaken),
            Self::ParameterError => Some(ErrorClass::Parameter),
            Self::NetworkError => Some(ErrorClass::Network),
            Self::AuthError => Some(ErrorClass::Auth),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit record of one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based issuance order within the run
    pub sequence: u32,
    /// Local issuance time
    pub timestamp: DateTime<Utc>,
    pub target: TargetKey,
    /// Slot label actually submitted
    pub start_time: SlotTime,
    pub http_status: Option<u16>,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub latency_ms: u64,
}

// ============================================================================
// Clock and Session
// ============================================================================

/// Estimated difference between the authoritative clock and the local clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockOffset {
    /// When the measurement was taken, `None` if never measured
    pub measured_at: Option<DateTime<Utc>>,
    /// Positive when the server is ahead of the local clock
    pub offset_ms: i64,
    pub rtt_ms: Option<i64>,
    pub stale: bool,
}

impl ClockOffset {
    /// Fail-safe value used before the first successful measurement
    pub fn unmeasured() -> Self {
        Self {
            measured_at: None,
            offset_ms: 0,
            rtt_ms: None,
            stale: true,
        }
    }

    pub fn as_delta(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.offset_ms)
    }
}

impl Default for ClockOffset {
    fn default() -> Self {
        Self::unmeasured()
    }
}

/// Authenticated session credential
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub estimated_expiry: DateTime<Utc>,
    /// Increments on every swap
    pub generation: u64,
}

impl Session {
    /// Short masked form safe for logs and status output
    pub fn token_preview(&self) -> String {
        let visible: String = self.token.chars().take(12).collect();
        if self.token.chars().count() > 12 {
            format!("{visible}...")
        } else {
            visible
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token_preview())
            .field("issued_at", &self.issued_at)
            .field("estimated_expiry", &self.estimated_expiry)
            .field("generation", &self.generation)
            .finish()
    }
}
