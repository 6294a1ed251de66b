//! Availability polling and slot classification
//!
//! [`AvailabilityPoller::poll`] turns one feed response into a
//! [`PollSample`]. Malformed bodies and failed requests become `UNKNOWN`
//! samples rather than errors, so a flaky upstream never stops a run.
//!
//! Two feed shapes are understood:
//!
//! - event detail: `{"event_schedules": {"<id>": {"start_time": "1000", "time_status": 0}}}`
//!   where `time_status` 0/1/2 means open/limited/closed
//! - capacity map: `{"<pavilion_id>": [{"t": "1845", "s": 3}]}` with free
//!   counts, classified against the `low_water` threshold
//!
//! The poller also owns the polling cadence: repeated 429/403 answers double
//! the interval up to a cap, and any other answer restores the base interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::client::AvailabilityFeed;
use crate::clock::WallClock;
use crate::config::PollerConfig;
use crate::error::ErrorClass;
use crate::metrics;
use crate::models::{PollSample, PollStatus, Session, SlotTime, Target};

// ============================================================================
// Feed Shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedBody {
    EventDetail {
        event_schedules: HashMap<String, ScheduleEntry>,
    },
    Capacity(HashMap<String, Vec<CapacitySlot>>),
}

#[derive(Debug, Deserialize)]
struct ScheduleEntry {
    start_time: String,
    time_status: i64,
}

#[derive(Debug, Deserialize)]
struct CapacitySlot {
    t: String,
    s: i64,
}

/// Classification of a parsed feed for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedClassification {
    pub status: PollStatus,
    pub slot_time: Option<SlotTime>,
    pub capacity: Option<u32>,
}

impl FeedClassification {
    fn closed() -> Self {
        Self {
            status: PollStatus::Closed,
            slot_time: None,
            capacity: None,
        }
    }
}

/// Classify a free-capacity count
pub fn classify_capacity(free: i64, low_water: u32) -> PollStatus {
    if free <= 0 {
        PollStatus::Closed
    } else if free < i64::from(low_water) {
        PollStatus::Limited
    } else {
        PollStatus::Open
    }
}

fn classify_time_status(time_status: i64) -> PollStatus {
    match time_status {
        0 => PollStatus::Open,
        1 => PollStatus::Limited,
        _ => PollStatus::Closed,
    }
}

/// Parse a feed body and pick the best slot for `target`
///
/// When the target names a slot only that slot is considered. The best slot
/// is the highest-ranked status, earliest time first on ties.
pub fn classify_feed(
    body: &str,
    target: &Target,
    low_water: u32,
) -> Result<FeedClassification, serde_json::Error> {
    let feed: FeedBody = serde_json::from_str(body)?;

    let candidates: Vec<(SlotTime, PollStatus, Option<u32>)> = match feed {
        FeedBody::EventDetail { event_schedules } => event_schedules
            .values()
            .filter_map(|entry| {
                let slot = entry.start_time.parse::<SlotTime>().ok()?;
                Some((slot, classify_time_status(entry.time_status), None))
            })
            .collect(),
        FeedBody::Capacity(mut pavilions) => pavilions
            .remove(&target.pavilion_id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|slot| {
                let time = slot.t.parse::<SlotTime>().ok()?;
                let free = u32::try_from(slot.s.max(0)).unwrap_or(u32::MAX);
                Some((time, classify_capacity(slot.s, low_water), Some(free)))
            })
            .collect(),
    };

    let best = candidates
        .into_iter()
        .filter(|(slot, _, _)| target.start_time.map_or(true, |wanted| wanted == *slot))
        .max_by(|a, b| a.1.rank().cmp(&b.1.rank()).then(b.0.cmp(&a.0)));

    Ok(match best {
        Some((slot, status, capacity)) => FeedClassification {
            status,
            slot_time: Some(slot),
            capacity,
        },
        None => FeedClassification::closed(),
    })
}

// ============================================================================
// Poller
// ============================================================================

/// Polls the availability feed for one target
pub struct AvailabilityPoller {
    feed: Arc<dyn AvailabilityFeed>,
    wall: Arc<dyn WallClock>,
    config: PollerConfig,
    interval: Duration,
    consecutive_throttled: u32,
}

impl AvailabilityPoller {
    pub fn new(feed: Arc<dyn AvailabilityFeed>, wall: Arc<dyn WallClock>, config: PollerConfig) -> Self {
        let interval = config.interval();
        Self {
            feed,
            wall,
            config,
            interval,
            consecutive_throttled: 0,
        }
    }

    /// Delay before the next poll
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Query the feed once and classify the answer
    pub async fn poll(&mut self, target: &Target, session: Option<&Session>) -> PollSample {
        let timestamp = self.wall.now();
        let mut sample = PollSample {
            timestamp,
            target: target.key(),
            status: PollStatus::Unknown,
            slot_time: None,
            capacity: None,
            http_status: None,
            error: None,
        };

        match self.feed.fetch_availability(target, session).await {
            Ok(response) => {
                sample.http_status = Some(response.status);
                self.note_status(response.status);

                match response.status {
                    200..=299 => match classify_feed(&response.body, target, self.config.low_water) {
                        Ok(classified) => {
                            sample.status = classified.status;
                            sample.slot_time = classified.slot_time;
                            sample.capacity = classified.capacity;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Malformed availability response");
                            sample.error = Some(ErrorClass::Network);
                        }
                    },
                    401 => sample.error = Some(ErrorClass::Auth),
                    status => {
                        tracing::debug!(status, "Availability request rejected");
                        sample.error = Some(ErrorClass::Network);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Availability request failed");
                self.note_status(0);
                sample.error = Some(ErrorClass::Network);
            }
        }

        metrics::record_poll(sample.status.as_str());
        tracing::debug!(
            target = %sample.target,
            status = %sample.status,
            slot = ?sample.slot_time,
            capacity = ?sample.capacity,
            "Poll sample"
        );
        sample
    }

    fn note_status(&mut self, status: u16) {
        if matches!(status, 403 | 429) {
            self.consecutive_throttled += 1;
            if self.consecutive_throttled >= self.config.throttle_threshold {
                let doubled = self.interval.saturating_mul(2).min(self.config.backoff_cap());
                if doubled != self.interval {
                    tracing::warn!(
                        status,
                        interval_ms = doubled.as_millis() as u64,
                        "Availability feed throttling, backing off"
                    );
                }
                self.interval = doubled;
            }
        } else if self.consecutive_throttled > 0 || self.interval != self.config.interval() {
            self.consecutive_throttled = 0;
            self.interval = self.config.interval();
            tracing::info!("Availability feed recovered, restoring poll interval");
        }
    }
}
