//! Per-run worker
//!
//! One task per armed target drives the phases:
//!
//! ```text
//! ARMED ──(lead reached | OPEN/LIMITED sample)──▶ WAITING
//! WAITING ──(corrected instant reached)──▶ BURSTING
//! BURSTING ──▶ SUCCEEDED | EXHAUSTED
//! any live phase ──(cancel)──▶ CANCELLED
//! ```
//!
//! Every sleep races the cancel flag, and the flag is checked again before
//! each attempt is issued and after each response returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use super::state::{RunPhase, RunStatus, TerminalReason};
use super::EngineContext;
use crate::error::ErrorClass;
use crate::metrics;
use crate::models::{AttemptOutcome, Session, SlotTime, Target, TriggerMode, WindowPolicy};
use crate::notifications::SuccessEvent;
use crate::poller::AvailabilityPoller;

/// Longest single sleep while armed for a scheduled instant
const ARMED_TICK: Duration = Duration::from_millis(250);

/// Resolves once the cancel flag is raised
pub(super) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        // Sender gone without cancelling; the registry dropped the run
        std::future::pending::<()>().await;
    }
}

pub(super) struct RunWorker {
    ctx: Arc<EngineContext>,
    run_id: Uuid,
    target: Target,
    mode: TriggerMode,
    window: WindowPolicy,
    status: Arc<RwLock<RunStatus>>,
    phase_tx: watch::Sender<RunPhase>,
    cancel_rx: watch::Receiver<bool>,
    sequence: u32,
}

impl RunWorker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        ctx: Arc<EngineContext>,
        run_id: Uuid,
        target: Target,
        mode: TriggerMode,
        window: WindowPolicy,
        status: Arc<RwLock<RunStatus>>,
        phase_tx: watch::Sender<RunPhase>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            run_id,
            target,
            mode,
            window,
            status,
            phase_tx,
            cancel_rx,
            sequence: 0,
        }
    }

    pub(super) async fn run(mut self) {
        let reason = self.drive().await;
        self.finish(reason).await;
    }

    async fn drive(&mut self) -> TerminalReason {
        let slot = match self.mode {
            TriggerMode::Scheduled(at) => {
                let lead = TimeDelta::from_std(self.ctx.config.prefire_lead())
                    .unwrap_or(TimeDelta::zero());
                if self.sleep_until_corrected(at - lead, ARMED_TICK).await {
                    return TerminalReason::Cancelled;
                }
                self.enter(RunPhase::Waiting).await;
                self.remeasure_clock().await;
                let granularity = self.ctx.config.wait_granularity();
                if self.sleep_until_corrected(at, granularity).await {
                    return TerminalReason::Cancelled;
                }
                self.target.start_time
            }
            TriggerMode::OnAvailability => match self.watch_availability().await {
                Some(slot) => {
                    self.enter(RunPhase::Waiting).await;
                    Some(slot)
                }
                None => return TerminalReason::Cancelled,
            },
            TriggerMode::Immediate => {
                self.enter(RunPhase::Waiting).await;
                self.target.start_time
            }
        };

        if self.is_cancelled() {
            return TerminalReason::Cancelled;
        }
        self.enter(RunPhase::Bursting).await;

        match slot {
            Some(slot) => self.burst(slot).await,
            None => {
                self.status
                    .write()
                    .await
                    .record_error(ErrorClass::Config, "no slot time to submit");
                TerminalReason::ParameterRejected
            }
        }
    }

    // ------------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------------

    /// Sleep until the corrected clock reaches `instant`, in ticks of at most
    /// `tick`. Returns `true` when cancelled first.
    async fn sleep_until_corrected(&mut self, instant: DateTime<Utc>, tick: Duration) -> bool {
        loop {
            if self.is_cancelled() {
                return true;
            }
            let remaining = instant - self.ctx.clock.corrected_now();
            let Ok(remaining) = remaining.to_std() else {
                return false;
            };
            if remaining.is_zero() {
                return false;
            }
            if self.sleep_or_cancel(remaining.min(tick)).await {
                return true;
            }
        }
    }

    /// Refresh the offset right before a scheduled fire
    async fn remeasure_clock(&mut self) {
        let clock_config = self.ctx.clock.config();
        if !clock_config.remeasure_before_fire {
            return;
        }
        let drift_warn_ms = clock_config.drift_warn_ms;

        let before = self.ctx.clock.current_offset();
        let budget = self.ctx.config.prefire_lead().max(Duration::from_millis(100));
        let measured = tokio::select! {
            result = tokio::time::timeout(budget, self.ctx.clock.measure()) => result.ok(),
            _ = wait_cancelled(&mut self.cancel_rx) => return,
        };

        let Some(after) = measured else {
            tracing::warn!(run_id = %self.run_id, "Clock re-measure timed out, using last offset");
            return;
        };

        let drift = (after.offset_ms - before.offset_ms).abs();
        if before.measured_at.is_some() && drift > drift_warn_ms {
            self.status.write().await.record_error(
                ErrorClass::ClockDrift,
                format!("offset moved {drift}ms before fire"),
            );
        }
    }

    /// Poll until the target's slot is OPEN or LIMITED
    async fn watch_availability(&mut self) -> Option<SlotTime> {
        let mut poller = AvailabilityPoller::new(
            Arc::clone(&self.ctx.feed),
            self.ctx.clock.wall(),
            self.ctx.poller.clone(),
        );

        loop {
            if self.is_cancelled() {
                return None;
            }

            let session = self.ctx.session.current_token();
            let sample = poller.poll(&self.target, session.as_deref()).await;
            if self.is_cancelled() {
                return None;
            }

            if sample.error == Some(ErrorClass::Auth) {
                self.ctx.session.invalidate("availability feed returned 401");
            }
            let picked = if sample.status.is_available() {
                self.target.start_time.or(sample.slot_time)
            } else {
                None
            };
            self.status
                .write()
                .await
                .record_sample(sample, self.ctx.config.sample_history_limit);

            if let Some(slot) = picked {
                tracing::info!(run_id = %self.run_id, slot = %slot, "Availability detected");
                return Some(slot);
            }

            if self.sleep_or_cancel(poller.interval()).await {
                return None;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Bursting
    // ------------------------------------------------------------------------

    async fn burst(&mut self, slot: SlotTime) -> TerminalReason {
        let mut deadline = self.window.duration().map(|window| Instant::now() + window);
        if let Some(window) = self.window.duration() {
            let closes = self.ctx.clock.local_now()
                + TimeDelta::from_std(window).unwrap_or(TimeDelta::zero());
            let mut status = self.status.write().await;
            status.window_deadline = Some(closes);
            status.slot_time = Some(slot);
        }
        tracing::info!(
            run_id = %self.run_id,
            target = %self.target.key(),
            slot = %slot,
            window_secs = ?self.window.duration().map(|d| d.as_secs()),
            "Burst started"
        );

        loop {
            if self.is_cancelled() {
                return TerminalReason::Cancelled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return TerminalReason::WindowElapsed;
            }

            let session = match self.ctx.session.current_token() {
                Some(session) => session,
                None => {
                    let seen = self.ctx.session.generation();
                    match self.pause_for_auth(seen, &mut deadline).await {
                        Ok(session) => session,
                        Err(reason) => return reason,
                    }
                }
            };

            self.sequence += 1;
            let record = self
                .ctx
                .submission
                .fire(&self.target, slot, &session, self.sequence)
                .await;

            if self.is_cancelled() {
                tracing::info!(
                    run_id = %self.run_id,
                    sequence = record.sequence,
                    outcome = %record.outcome,
                    "Discarding response received after cancel"
                );
                return TerminalReason::Cancelled;
            }

            let outcome = record.outcome;
            metrics::record_attempt(outcome.as_str());
            let Some(consecutive_taken) = self.status.write().await.record_attempt(record) else {
                return TerminalReason::Cancelled;
            };

            match outcome {
                AttemptOutcome::Success => {
                    self.notify_success(slot).await;
                    return TerminalReason::Succeeded;
                }
                AttemptOutcome::ParameterError => return TerminalReason::ParameterRejected,
                AttemptOutcome::SlotTaken => {
                    if self
                        .ctx
                        .config
                        .max_consecutive_slot_taken
                        .is_some_and(|max| consecutive_taken >= max)
                    {
                        return TerminalReason::SlotTakenLimit;
                    }
                }
                AttemptOutcome::AuthError => {
                    self.ctx
                        .session
                        .invalidate("reservation endpoint returned 401");
                    if let Err(reason) = self.pause_for_auth(session.generation, &mut deadline).await {
                        return reason;
                    }
                }
                AttemptOutcome::NetworkError => {}
            }

            if self.sleep_or_cancel(self.next_delay()).await {
                return TerminalReason::Cancelled;
            }
        }
    }

    /// Suspend issuance until a session newer than `seen_generation` arrives
    ///
    /// The paused time does not count against the burst window.
    async fn pause_for_auth(
        &mut self,
        seen_generation: u64,
        deadline: &mut Option<Instant>,
    ) -> Result<Arc<Session>, TerminalReason> {
        let started = Instant::now();
        {
            let mut status = self.status.write().await;
            status.paused_for_auth = true;
            status.record_error(ErrorClass::Auth, "waiting for a fresh session");
        }
        tracing::warn!(run_id = %self.run_id, "Burst paused for session refresh");
        self.ctx.session.request_refresh();

        let guard = Arc::clone(&self.ctx.session);
        let resume_timeout = self.ctx.config.auth_resume_timeout();
        let result = tokio::select! {
            fresh = tokio::time::timeout(resume_timeout, guard.wait_for_fresh(seen_generation)) => {
                fresh.map_err(|_| TerminalReason::AuthTimeout)
            }
            _ = wait_cancelled(&mut self.cancel_rx) => Err(TerminalReason::Cancelled),
        };

        let paused = started.elapsed();
        if let Some(deadline) = deadline.as_mut() {
            *deadline += paused;
        }
        {
            let mut status = self.status.write().await;
            status.paused_for_auth = false;
            if let Some(closes) = status.window_deadline.as_mut() {
                *closes += TimeDelta::from_std(paused).unwrap_or(TimeDelta::zero());
            }
        }

        match &result {
            Ok(session) => tracing::info!(
                run_id = %self.run_id,
                generation = session.generation,
                paused_ms = paused.as_millis() as u64,
                "Burst resumed with fresh session"
            ),
            Err(reason) => tracing::warn!(run_id = %self.run_id, reason = ?reason, "Burst ended while paused"),
        }
        result
    }

    fn next_delay(&self) -> Duration {
        let interval = self.ctx.config.attempt_interval();
        let jitter_ms = self.ctx.config.attempt_jitter_ms;
        if jitter_ms == 0 {
            return interval;
        }
        interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    async fn notify_success(&self, slot: SlotTime) {
        let Some(notifier) = self.ctx.notifier.clone() else {
            return;
        };
        let event = SuccessEvent {
            run_id: self.run_id,
            key: self.target.key(),
            slot,
            sequence: self.sequence,
            at: self.ctx.clock.corrected_now(),
        };
        tokio::spawn(async move {
            match notifier.send(&event.render()).await {
                Ok(status) => tracing::debug!(status = %status, "Success notification sent"),
                Err(e) => tracing::warn!(error = %e, "Success notification failed"),
            }
        });
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Returns `true` when the cancel flag is raised before `duration` elapses
    async fn sleep_or_cancel(&mut self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = wait_cancelled(&mut self.cancel_rx) => {}
        }
        self.is_cancelled()
    }

    async fn enter(&self, phase: RunPhase) {
        let now = self.ctx.clock.local_now();
        if let Err(e) = self.status.write().await.transition(phase, now) {
            tracing::warn!(run_id = %self.run_id, error = %e, "Rejected phase change");
            return;
        }
        self.phase_tx.send_replace(phase);
        tracing::info!(run_id = %self.run_id, phase = %phase, "Run phase changed");
    }

    async fn finish(&self, reason: TerminalReason) {
        let phase = reason.phase();
        let now = self.ctx.clock.local_now();
        let attempts = {
            let mut status = self.status.write().await;
            if let Err(e) = status.transition(phase, now) {
                tracing::warn!(run_id = %self.run_id, error = %e, "Rejected terminal phase");
            }
            status.terminal_reason = Some(reason);
            status.attempts.len()
        };

        metrics::record_run_finished(phase.as_str());
        self.phase_tx.send_replace(phase);
        tracing::info!(
            run_id = %self.run_id,
            target = %self.target.key(),
            phase = %phase,
            reason = ?reason,
            attempts,
            "Run finished"
        );
    }
}
