//! Reservation scheduler
//!
//! [`ReservationScheduler`] owns the registry of runs. Each started run gets
//! its own worker task and a [`RunStatus`] that only that worker writes;
//! everyone else reads snapshots. At most one live run exists per
//! [`TargetKey`].
//!
//! # Trigger modes
//!
//! | Mode             | Leaves ARMED when                          | Window     |
//! |------------------|--------------------------------------------|------------|
//! | `Scheduled`      | corrected clock reaches instant minus lead | bounded    |
//! | `OnAvailability` | a poll sample is OPEN or LIMITED           | bounded    |
//! | `Immediate`      | right away                                 | unbounded  |

pub mod error;
pub mod state;
mod worker;

pub use error::{RunError, RunResult};
pub use state::{RunPhase, RunStatus, RunSummary, TerminalReason};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::client::AvailabilityFeed;
use crate::clock::ClockSync;
use crate::config::{PollerConfig, SchedulerConfig};
use crate::metrics;
use crate::models::{Target, TargetKey, TriggerMode, WindowPolicy};
use crate::notifications::Notifier;
use crate::session::SessionGuard;
use crate::submission::SubmissionAttempt;
use worker::RunWorker;

/// Shared collaborators handed to every run worker
pub struct EngineContext {
    pub clock: Arc<ClockSync>,
    pub session: Arc<SessionGuard>,
    pub feed: Arc<dyn AvailabilityFeed>,
    pub submission: Arc<SubmissionAttempt>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub config: SchedulerConfig,
    pub poller: PollerConfig,
}

/// Operator request to configure and start a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub target: Target,
    /// Fire immediately and keep going until cancelled
    #[serde(default)]
    pub manual: bool,
}

impl RunRequest {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            manual: false,
        }
    }

    pub fn manual(target: Target) -> Self {
        Self {
            target,
            manual: true,
        }
    }
}

/// Burst window for a trigger mode
pub fn window_policy(mode: TriggerMode, config: &SchedulerConfig) -> WindowPolicy {
    match mode {
        TriggerMode::Scheduled(_) => WindowPolicy::Bounded(config.scheduled_window()),
        TriggerMode::OnAvailability => WindowPolicy::Bounded(config.availability_window()),
        TriggerMode::Immediate => WindowPolicy::Unbounded,
    }
}

struct RunHandle {
    key: TargetKey,
    created_at: DateTime<Utc>,
    status: Arc<RwLock<RunStatus>>,
    cancel_tx: watch::Sender<bool>,
    phase_rx: watch::Receiver<RunPhase>,
}

impl RunHandle {
    fn phase(&self) -> RunPhase {
        *self.phase_rx.borrow()
    }

    fn is_active(&self) -> bool {
        !self.phase().is_terminal()
    }
}

pub struct ReservationScheduler {
    ctx: Arc<EngineContext>,
    runs: RwLock<HashMap<Uuid, RunHandle>>,
}

impl ReservationScheduler {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Validate the target, arm a run and spawn its worker
    ///
    /// Fails without creating a run when the target is incomplete or the
    /// same target already has a live run.
    pub async fn start(&self, request: RunRequest) -> RunResult<Uuid> {
        let RunRequest { target, manual } = request;
        let mode = TriggerMode::for_target(&target, manual);
        target.validate(mode.requires_start_time())?;

        let window = window_policy(mode, &self.ctx.config);
        let key = target.key();

        let mut runs = self.runs.write().await;
        if let Some((run_id, _)) = runs.iter().find(|(_, h)| h.key == key && h.is_active()) {
            return Err(RunError::AlreadyActive {
                key,
                run_id: *run_id,
            });
        }

        let run_id = Uuid::new_v4();
        let now = self.ctx.clock.local_now();
        let mut status = RunStatus::new(
            run_id,
            target.clone(),
            mode,
            window,
            self.ctx.config.attempt_interval_ms,
            self.ctx.config.max_consecutive_slot_taken,
            now,
        );
        status.transition(RunPhase::Armed, now)?;
        let status = Arc::new(RwLock::new(status));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(RunPhase::Armed);

        let worker = RunWorker::new(
            Arc::clone(&self.ctx),
            run_id,
            target,
            mode,
            window,
            Arc::clone(&status),
            phase_tx,
            cancel_rx,
        );
        tokio::spawn(worker.run());

        runs.insert(
            run_id,
            RunHandle {
                key: key.clone(),
                created_at: now,
                status,
                cancel_tx,
                phase_rx,
            },
        );
        self.prune_finished(&mut runs);

        metrics::record_run_started();
        tracing::info!(run_id = %run_id, target = %key, mode = ?mode, "Run armed");
        Ok(run_id)
    }

    /// Drop the oldest finished runs beyond the retention limit
    fn prune_finished(&self, runs: &mut HashMap<Uuid, RunHandle>) {
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = runs
            .iter()
            .filter(|(_, h)| !h.is_active())
            .map(|(id, h)| (h.created_at, *id))
            .collect();

        let limit = self.ctx.config.max_finished_runs;
        if finished.len() <= limit {
            return;
        }
        finished.sort();
        for (_, id) in finished.iter().take(finished.len() - limit) {
            runs.remove(id);
        }
    }

    /// Ask a run to stop; returns the phase at the time of the request
    ///
    /// Cancelling a finished run is a no-op.
    pub async fn cancel(&self, run_id: Uuid) -> RunResult<RunPhase> {
        let runs = self.runs.read().await;
        let handle = runs.get(&run_id).ok_or(RunError::NotFound(run_id))?;
        let phase = handle.phase();
        if !phase.is_terminal() {
            handle.cancel_tx.send_replace(true);
            tracing::info!(run_id = %run_id, phase = %phase, "Cancel requested");
        }
        Ok(phase)
    }

    /// Cancel every live run, returning how many were signalled
    pub async fn cancel_all(&self) -> usize {
        let runs = self.runs.read().await;
        let mut cancelled = 0;
        for handle in runs.values().filter(|h| h.is_active()) {
            handle.cancel_tx.send_replace(true);
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled all active runs");
        }
        cancelled
    }

    /// Operator view of one run with its last `limit` attempts
    pub async fn status(&self, run_id: Uuid, limit: usize) -> RunResult<RunSummary> {
        let status = self.status_handle(run_id).await?;
        let now = self.ctx.clock.local_now();
        let summary = status.read().await.summary(now, limit);
        Ok(summary)
    }

    /// Full state of one run
    pub async fn snapshot(&self, run_id: Uuid) -> RunResult<RunStatus> {
        let status = self.status_handle(run_id).await?;
        let snapshot = status.read().await.clone();
        Ok(snapshot)
    }

    async fn status_handle(&self, run_id: Uuid) -> RunResult<Arc<RwLock<RunStatus>>> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .map(|h| Arc::clone(&h.status))
            .ok_or(RunError::NotFound(run_id))
    }

    /// All runs, oldest first
    pub async fn list(&self, limit: usize) -> Vec<RunSummary> {
        let now = self.ctx.clock.local_now();
        let mut summaries = Vec::new();
        for status in self.statuses().await {
            summaries.push(status.read().await.summary(now, limit));
        }
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Full state of every run, oldest first
    pub async fn snapshots(&self) -> Vec<RunStatus> {
        let mut snapshots = Vec::new();
        for status in self.statuses().await {
            snapshots.push(status.read().await.clone());
        }
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    async fn statuses(&self) -> Vec<Arc<RwLock<RunStatus>>> {
        self.runs
            .read()
            .await
            .values()
            .map(|h| Arc::clone(&h.status))
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.runs.read().await.values().filter(|h| h.is_active()).count()
    }

    /// Wait until the run reaches a terminal phase
    pub async fn wait(&self, run_id: Uuid) -> RunResult<RunPhase> {
        let mut phase_rx = self
            .runs
            .read()
            .await
            .get(&run_id)
            .map(|h| h.phase_rx.clone())
            .ok_or(RunError::NotFound(run_id))?;

        let terminal = phase_rx
            .wait_for(|phase| phase.is_terminal())
            .await
            .map(|phase| *phase);
        Ok(terminal.unwrap_or_else(|_| *phase_rx.borrow()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_window_policy_per_mode() {
        let config = SchedulerConfig {
            scheduled_window_secs: 60,
            availability_window_secs: 30,
            ..SchedulerConfig::default()
        };

        assert_eq!(
            window_policy(TriggerMode::Scheduled(Utc::now()), &config),
            WindowPolicy::Bounded(Duration::from_secs(60))
        );
        assert_eq!(
            window_policy(TriggerMode::OnAvailability, &config),
            WindowPolicy::Bounded(Duration::from_secs(30))
        );
        assert_eq!(window_policy(TriggerMode::Immediate, &config), WindowPolicy::Unbounded);
    }

    #[test]
    fn test_run_request_defaults_to_automatic() {
        let request: RunRequest = serde_json::from_str(
            r#"{"target":{"pavilion_id":"H1H9","date":"20251013","event_code":"H1H9","channel":5,"ticket_ids":["T1"]}}"#,
        )
        .unwrap();
        assert!(!request.manual);
        assert_eq!(
            TriggerMode::for_target(&request.target, request.manual),
            TriggerMode::OnAvailability
        );
    }
}
