//! Common test utilities: in-memory endpoints and an engine on tokio time

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};

use slotrush::adjust::SlotAdjustments;
use slotrush::client::{
    AvailabilityFeed, FetchError, RawResponse, ReservationEndpoint, ReservationPayload,
    SessionProbe,
};
use slotrush::clock::{ClockSync, OffsetSource, TokioClock, WallClock};
use slotrush::config::{ClockConfig, Config, PollerConfig, SchedulerConfig};
use slotrush::engine::{Collaborators, Engine};
use slotrush::models::{Session, Target};
use slotrush::scheduler::{EngineContext, ReservationScheduler};
use slotrush::session::SessionGuard;
use slotrush::submission::SubmissionAttempt;

/// Fixed wall-clock anchor used by every paused-time test
pub fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 10, 0, 0, 0).unwrap()
}

/// A complete target for pavilion `pavilion`
pub fn target(pavilion: &str) -> Target {
    Target {
        pavilion_id: pavilion.to_string(),
        date: NaiveDate::from_ymd_opt(2025, 10, 13).unwrap(),
        event_code: pavilion.to_string(),
        channel: 5,
        scheduled_instant: None,
        ticket_ids: vec!["T1".to_string(), "T2".to_string()],
        start_time: Some("1845".parse().unwrap()),
    }
}

pub fn scheduled_target(pavilion: &str, at: DateTime<Utc>) -> Target {
    Target {
        scheduled_instant: Some(at),
        ..target(pavilion)
    }
}

pub fn slot_taken() -> RawResponse {
    RawResponse::new(422, r#"{"error":{"name":"schedule_out_of_stock"}}"#)
}

pub fn success() -> RawResponse {
    RawResponse::new(200, "{}")
}

pub fn parameter_error() -> RawResponse {
    RawResponse::new(400, r#"{"error":{"name":"invalid_parameter"}}"#)
}

pub fn unauthorized() -> RawResponse {
    RawResponse::new(401, "")
}

// ============================================================================
// Scripted Endpoints
// ============================================================================

/// One recorded reservation call
#[derive(Debug, Clone)]
pub struct Call {
    pub payload: ReservationPayload,
    pub token: String,
    pub at: tokio::time::Instant,
}

/// Reservation endpoint answering from a script, then a fallback forever
pub struct ScriptedEndpoint {
    script: Mutex<VecDeque<RawResponse>>,
    fallback: RawResponse,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedEndpoint {
    pub fn new(script: Vec<RawResponse>, fallback: RawResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn always(response: RawResponse) -> Arc<Self> {
        Self::new(Vec::new(), response)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ReservationEndpoint for ScriptedEndpoint {
    async fn post_reservation(
        &self,
        payload: &ReservationPayload,
        session: &Session,
    ) -> Result<RawResponse, FetchError> {
        self.calls.lock().unwrap().push(Call {
            payload: payload.clone(),
            token: session.token.clone(),
            at: tokio::time::Instant::now(),
        });
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Availability feed answering from a script, then a fallback forever
pub struct ScriptedFeed {
    script: Mutex<VecDeque<RawResponse>>,
    fallback: RawResponse,
    polls: Mutex<usize>,
}

impl ScriptedFeed {
    pub fn new(script: Vec<RawResponse>, fallback: RawResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            polls: Mutex::new(0),
        })
    }

    /// Feed that never reports the target as available
    pub fn closed() -> Arc<Self> {
        Self::new(Vec::new(), RawResponse::new(200, "{}"))
    }

    pub fn poll_count(&self) -> usize {
        *self.polls.lock().unwrap()
    }
}

#[async_trait]
impl AvailabilityFeed for ScriptedFeed {
    async fn fetch_availability(
        &self,
        _target: &Target,
        _session: Option<&Session>,
    ) -> Result<RawResponse, FetchError> {
        *self.polls.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Session probe with a fixed answer
pub struct FixedProbe(pub u16);

#[async_trait]
impl SessionProbe for FixedProbe {
    async fn check_session(&self, _session: &Session) -> Result<u16, FetchError> {
        Ok(self.0)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Scheduler wired to in-memory endpoints on the tokio clock
pub struct Harness {
    pub wall: Arc<TokioClock>,
    pub clock: Arc<ClockSync>,
    pub session: Arc<SessionGuard>,
    pub endpoint: Arc<ScriptedEndpoint>,
    pub feed: Arc<ScriptedFeed>,
    pub scheduler: ReservationScheduler,
}

/// Scheduler settings with a 1s cadence and a 60s window
pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        attempt_interval_ms: 1000,
        scheduled_window_secs: 60,
        availability_window_secs: 60,
        ..SchedulerConfig::default()
    }
}

pub fn poller_config() -> PollerConfig {
    PollerConfig {
        interval_ms: 1000,
        ..PollerConfig::default()
    }
}

impl Harness {
    /// Build a harness whose server clock runs `offset_ms` ahead of local time
    ///
    /// Must be called inside a paused tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        offset_ms: i64,
        endpoint: Arc<ScriptedEndpoint>,
        feed: Arc<ScriptedFeed>,
    ) -> Self {
        let wall = Arc::new(TokioClock::starting_at(anchor()));
        let wall_dyn: Arc<dyn WallClock> = wall.clone();

        let source = Arc::new(OffsetSource::new(
            Arc::clone(&wall_dyn),
            TimeDelta::milliseconds(offset_ms),
        ));
        let clock = Arc::new(ClockSync::new(
            source,
            Arc::clone(&wall_dyn),
            ClockConfig {
                samples: 1,
                ..ClockConfig::default()
            },
        ));

        let session = Arc::new(SessionGuard::new(
            Arc::clone(&wall_dyn),
            std::time::Duration::from_secs(3600),
            std::time::Duration::from_secs(300),
        ));
        session.refresh("token-1").unwrap();

        let submission = Arc::new(SubmissionAttempt::new(
            endpoint.clone(),
            Arc::new(SlotAdjustments::new()),
            Arc::clone(&wall_dyn),
        ));

        let scheduler = ReservationScheduler::new(EngineContext {
            clock: Arc::clone(&clock),
            session: Arc::clone(&session),
            feed: feed.clone(),
            submission,
            notifier: None,
            config,
            poller: poller_config(),
        });

        Self {
            wall,
            clock,
            session,
            endpoint,
            feed,
            scheduler,
        }
    }

    /// Local time elapsed since the anchor
    pub fn elapsed_ms(&self, at: DateTime<Utc>) -> i64 {
        (at - anchor()).num_milliseconds()
    }
}

/// Engine on fake endpoints, for control interface tests
pub fn fake_engine(
    config: Config,
    endpoint: Arc<ScriptedEndpoint>,
    feed: Arc<ScriptedFeed>,
) -> Engine {
    let wall: Arc<dyn WallClock> = Arc::new(slotrush::clock::SystemClock);
    let parts = Collaborators {
        feed,
        endpoint,
        time_source: Arc::new(OffsetSource::new(Arc::clone(&wall), TimeDelta::milliseconds(120))),
        probe: Arc::new(FixedProbe(200)),
        wall,
    };
    Engine::new(config, parts).unwrap()
}
