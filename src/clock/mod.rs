//! Clock offset tracking against the authoritative server clock
//!
//! [`ClockSync`] estimates `offset = ts - (t0 + t1) / 2` where `t0`/`t1` are
//! local send/receive times and `ts` the server's reported time. The latest
//! value is published through a `watch` channel: one writer, many readers.
//!
//! Local time comes from a [`WallClock`] so the scheduler can be driven by
//! tokio's paused clock in tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::client::ServerTimeSource;
use crate::config::ClockConfig;
use crate::metrics;
use crate::models::ClockOffset;

// ============================================================================
// Wall Clocks
// ============================================================================

/// Source of local wall-clock time
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The operating system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock that advances with the tokio timer
///
/// Anchored to a wall time at construction; under `tokio::time::pause` it
/// moves exactly as far as the runtime's virtual clock.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl WallClock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.anchor);
        self.anchor_wall + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::MAX)
    }
}

// ============================================================================
// Clock Sync
// ============================================================================

/// Tracks the offset between the local and authoritative clocks
pub struct ClockSync {
    source: Arc<dyn ServerTimeSource>,
    wall: Arc<dyn WallClock>,
    config: ClockConfig,
    offset_tx: watch::Sender<ClockOffset>,
}

impl ClockSync {
    pub fn new(
        source: Arc<dyn ServerTimeSource>,
        wall: Arc<dyn WallClock>,
        config: ClockConfig,
    ) -> Self {
        let (offset_tx, _) = watch::channel(ClockOffset::unmeasured());
        Self {
            source,
            wall,
            config,
            offset_tx,
        }
    }

    /// Probe the server and publish a new offset
    ///
    /// Takes `samples` probes and keeps the one with the smallest round
    /// trip. When every probe fails the previous offset is retained and
    /// flagged stale; this never returns an error.
    pub async fn measure(&self) -> ClockOffset {
        let mut best: Option<(TimeDelta, TimeDelta, DateTime<Utc>)> = None;
        let mut last_error = None;

        for _ in 0..self.config.samples {
            let t0 = self.wall.now();
            match self.source.server_time().await {
                Ok(ts) => {
                    let t1 = self.wall.now();
                    let rtt = t1 - t0;
                    let midpoint = t0 + rtt / 2;
                    let offset = ts - midpoint;
                    if best.map_or(true, |(best_rtt, _, _)| rtt < best_rtt) {
                        best = Some((rtt, offset, t1));
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Clock probe failed");
                    last_error = Some(e);
                }
            }
        }

        let previous = *self.offset_tx.borrow();

        let Some((rtt, offset, measured_at)) = best else {
            let retained = ClockOffset {
                stale: true,
                ..previous
            };
            tracing::warn!(
                error = ?last_error.map(|e| e.to_string()),
                offset_ms = retained.offset_ms,
                "Clock measurement failed, keeping previous offset"
            );
            self.offset_tx.send_replace(retained);
            return retained;
        };

        let measured = ClockOffset {
            measured_at: Some(measured_at),
            offset_ms: offset.num_milliseconds(),
            rtt_ms: Some(rtt.num_milliseconds()),
            stale: false,
        };

        if previous.measured_at.is_some() {
            let drift = (measured.offset_ms - previous.offset_ms).abs();
            if drift > self.config.drift_warn_ms {
                tracing::warn!(
                    previous_ms = previous.offset_ms,
                    current_ms = measured.offset_ms,
                    drift_ms = drift,
                    "Clock drift exceeds warning threshold"
                );
            }
        }

        tracing::info!(
            offset_ms = measured.offset_ms,
            rtt_ms = ?measured.rtt_ms,
            "Clock offset measured"
        );
        metrics::set_clock_offset(measured.offset_ms);
        self.offset_tx.send_replace(measured);
        measured
    }

    /// Most recent offset; stale when never measured or older than `stale_after`
    pub fn current_offset(&self) -> ClockOffset {
        let mut offset = *self.offset_tx.borrow();
        if let Some(measured_at) = offset.measured_at {
            let age = self.wall.now() - measured_at;
            if age.to_std().map_or(false, |age| age > self.config.stale_after()) {
                offset.stale = true;
            }
        }
        offset
    }

    /// Local wall time corrected by the current offset
    pub fn corrected_now(&self) -> DateTime<Utc> {
        self.wall.now() + self.offset_tx.borrow().as_delta()
    }

    /// Uncorrected local wall time
    pub fn local_now(&self) -> DateTime<Utc> {
        self.wall.now()
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    pub fn wall(&self) -> Arc<dyn WallClock> {
        Arc::clone(&self.wall)
    }

    pub fn subscribe(&self) -> watch::Receiver<ClockOffset> {
        self.offset_tx.subscribe()
    }

    /// Re-measure on a fixed interval until shutdown
    pub fn spawn_refresher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Clock refresher started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        self.measure().await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Clock refresher stopping");
                        return;
                    }
                }
            }
        })
    }
}

/// Fixed-offset source, useful for dry runs against a simulated server
pub struct OffsetSource {
    wall: Arc<dyn WallClock>,
    offset: TimeDelta,
}

impl OffsetSource {
    pub fn new(wall: Arc<dyn WallClock>, offset: TimeDelta) -> Self {
        Self { wall, offset }
    }
}

#[async_trait]
impl ServerTimeSource for OffsetSource {
    async fn server_time(&self) -> Result<DateTime<Utc>, crate::client::FetchError> {
        Ok(self.wall.now() + self.offset)
    }
}
