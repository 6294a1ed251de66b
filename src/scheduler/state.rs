//! Run state machine and status snapshots

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{RunError, RunResult};
use crate::error::ErrorClass;
use crate::models::{
    AttemptOutcome, AttemptRecord, PollSample, SlotTime, Target, TargetKey, TriggerMode,
    WindowPolicy,
};

/// Phase of a reservation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Idle,
    Armed,
    Waiting,
    Bursting,
    Succeeded,
    Exhausted,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted | Self::Cancelled)
    }

    /// Legal edges: IDLE → ARMED → WAITING → BURSTING → terminal, and any
    /// live phase → CANCELLED
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        match (self, next) {
            (Idle, Armed) | (Armed, Waiting) | (Waiting, Bursting) => true,
            (Bursting, Succeeded) | (Bursting, Exhausted) => true,
            (current, Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Armed => "ARMED",
            Self::Waiting => "WAITING",
            Self::Bursting => "BURSTING",
            Self::Succeeded => "SUCCEEDED",
            Self::Exhausted => "EXHAUSTED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run reached its terminal phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// An attempt returned SUCCESS
    Succeeded,
    /// The burst window elapsed
    WindowElapsed,
    /// Too many consecutive SLOT_TAKEN answers
    SlotTakenLimit,
    /// The endpoint rejected the request parameters
    ParameterRejected,
    /// No fresh session arrived before the resume timeout
    AuthTimeout,
    /// Operator cancellation
    Cancelled,
}

impl TerminalReason {
    pub fn phase(&self) -> RunPhase {
        match self {
            Self::Succeeded => RunPhase::Succeeded,
            Self::Cancelled => RunPhase::Cancelled,
            Self::WindowElapsed
            | Self::SlotTakenLimit
            | Self::ParameterRejected
            | Self::AuthTimeout => RunPhase::Exhausted,
        }
    }
}

/// Full state of one run, written only by its worker
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub target: Target,
    pub key: TargetKey,
    pub mode: TriggerMode,
    /// Burst window length, `None` when operator-terminated
    pub window_secs: Option<u64>,
    pub attempt_interval_ms: u64,
    pub max_consecutive_slot_taken: Option<u32>,
    pub phase: RunPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub burst_started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Local time the burst window closes, pushed back by auth pauses
    pub window_deadline: Option<DateTime<Utc>>,
    /// Slot being raced for
    pub slot_time: Option<SlotTime>,
    pub attempts: Vec<AttemptRecord>,
    pub samples: VecDeque<PollSample>,
    pub poll_count: u64,
    pub consecutive_slot_taken: u32,
    pub last_error: Option<ErrorClass>,
    pub last_error_detail: Option<String>,
    pub paused_for_auth: bool,
    pub terminal_reason: Option<TerminalReason>,
}

impl RunStatus {
    pub fn new(
        run_id: Uuid,
        target: Target,
        mode: TriggerMode,
        window: WindowPolicy,
        attempt_interval_ms: u64,
        max_consecutive_slot_taken: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            key: target.key(),
            slot_time: target.start_time,
            target,
            mode,
            window_secs: window.duration().map(|d| d.as_secs()),
            attempt_interval_ms,
            max_consecutive_slot_taken,
            phase: RunPhase::Idle,
            created_at: now,
            updated_at: now,
            burst_started_at: None,
            finished_at: None,
            window_deadline: None,
            attempts: Vec::new(),
            samples: VecDeque::new(),
            poll_count: 0,
            consecutive_slot_taken: 0,
            last_error: None,
            last_error_detail: None,
            paused_for_auth: false,
            terminal_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }

    /// Move to `next`, rejecting edges the state machine does not allow
    pub fn transition(&mut self, next: RunPhase, now: DateTime<Utc>) -> RunResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(RunError::invalid_transition(self.phase, next));
        }
        self.phase = next;
        self.updated_at = now;
        if next == RunPhase::Bursting {
            self.burst_started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.paused_for_auth = false;
        }
        Ok(())
    }

    /// Append an attempt; ignored once the run is terminal
    ///
    /// Returns the consecutive SLOT_TAKEN count after the attempt, or `None`
    /// when the record was discarded.
    pub fn record_attempt(&mut self, record: AttemptRecord) -> Option<u32> {
        if self.phase.is_terminal() {
            return None;
        }

        if record.outcome == AttemptOutcome::SlotTaken {
            self.consecutive_slot_taken += 1;
        } else {
            self.consecutive_slot_taken = 0;
        }
        if let Some(class) = record.outcome.error_class() {
            self.last_error = Some(class);
            self.last_error_detail = record.detail.clone();
        }
        self.updated_at = record.timestamp;
        self.attempts.push(record);
        Some(self.consecutive_slot_taken)
    }

    /// Keep a bounded history of poll samples
    pub fn record_sample(&mut self, sample: PollSample, limit: usize) {
        if let Some(class) = sample.error {
            self.last_error = Some(class);
            self.last_error_detail = sample.http_status.map(|s| format!("availability feed returned {s}"));
        }
        if sample.status.is_available() {
            self.slot_time = self.target.start_time.or(sample.slot_time);
        }
        self.updated_at = sample.timestamp;
        self.poll_count += 1;
        self.samples.push_back(sample);
        while self.samples.len() > limit {
            self.samples.pop_front();
        }
    }

    pub fn record_error(&mut self, class: ErrorClass, detail: impl Into<String>) {
        self.last_error = Some(class);
        self.last_error_detail = Some(detail.into());
    }

    /// Remaining burst time in milliseconds, `None` when unbounded
    pub fn remaining_window_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        let window_ms = self.window_secs? as i64 * 1000;
        if self.phase.is_terminal() {
            return Some(0);
        }
        match self.window_deadline {
            Some(deadline) => Some((deadline - now).num_milliseconds().max(0)),
            None => Some(window_ms),
        }
    }

    /// Upper bound on further attempts given the window and the SLOT_TAKEN limit
    pub fn remaining_attempts(&self, now: DateTime<Utc>) -> Option<u64> {
        if self.phase.is_terminal() {
            return Some(0);
        }
        let by_window = self
            .remaining_window_ms(now)
            .map(|ms| (ms as u64).div_ceil(self.attempt_interval_ms.max(1)));
        let by_limit = self
            .max_consecutive_slot_taken
            .map(|max| u64::from(max.saturating_sub(self.consecutive_slot_taken)));

        match (by_window, by_limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Operator view with the last `limit` attempts
    pub fn summary(&self, now: DateTime<Utc>, limit: usize) -> RunSummary {
        let skip = self.attempts.len().saturating_sub(limit);
        RunSummary {
            run_id: self.run_id,
            key: self.key.clone(),
            mode: self.mode,
            phase: self.phase,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
            slot_time: self.slot_time,
            attempt_count: self.attempts.len(),
            recent_attempts: self.attempts[skip..].to_vec(),
            last_sample: self.samples.back().cloned(),
            poll_count: self.poll_count,
            consecutive_slot_taken: self.consecutive_slot_taken,
            last_error: self.last_error,
            last_error_detail: self.last_error_detail.clone(),
            remaining_window_ms: self.remaining_window_ms(now),
            remaining_attempts: self.remaining_attempts(now),
            paused_for_auth: self.paused_for_auth,
            terminal_reason: self.terminal_reason,
        }
    }
}

/// Run state exposed on the control interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub key: TargetKey,
    pub mode: TriggerMode,
    pub phase: RunPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub slot_time: Option<SlotTime>,
    pub attempt_count: usize,
    pub recent_attempts: Vec<AttemptRecord>,
    pub last_sample: Option<PollSample>,
    pub poll_count: u64,
    pub consecutive_slot_taken: u32,
    pub last_error: Option<ErrorClass>,
    pub last_error_detail: Option<String>,
    pub remaining_window_ms: Option<i64>,
    pub remaining_attempts: Option<u64>,
    pub paused_for_auth: bool,
    pub terminal_reason: Option<TerminalReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};
    use std::time::Duration;

    fn status(window: WindowPolicy) -> RunStatus {
        let target = Target {
            pavilion_id: "H1H9".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 10, 13).unwrap(),
            event_code: "H1H9".to_string(),
            channel: 5,
            scheduled_instant: None,
            ticket_ids: vec!["T1".to_string()],
            start_time: Some("1845".parse().unwrap()),
        };
        RunStatus::new(
            Uuid::new_v4(),
            target,
            TriggerMode::Immediate,
            window,
            1000,
            Some(3),
            Utc::now(),
        )
    }

    fn attempt(status: &RunStatus, sequence: u32, outcome: AttemptOutcome) -> AttemptRecord {
        AttemptRecord {
            sequence,
            timestamp: Utc::now(),
            target: status.key.clone(),
            start_time: "1845".parse().unwrap(),
            http_status: Some(422),
            outcome,
            detail: None,
            latency_ms: 10,
        }
    }

    #[test]
    fn test_transition_table() {
        use RunPhase::*;
        assert!(Idle.can_transition_to(Armed));
        assert!(Armed.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Bursting));
        assert!(Bursting.can_transition_to(Exhausted));
        assert!(Armed.can_transition_to(Cancelled));
        assert!(!Armed.can_transition_to(Bursting));
        assert!(!Waiting.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Cancelled));
        assert!(!Exhausted.can_transition_to(Bursting));
    }

    #[test]
    fn test_terminal_run_rejects_transitions_and_attempts() {
        let mut s = status(WindowPolicy::Unbounded);
        let now = Utc::now();
        s.transition(RunPhase::Armed, now).unwrap();
        s.transition(RunPhase::Cancelled, now).unwrap();

        assert!(s.transition(RunPhase::Waiting, now).is_err());
        let record = attempt(&s, 1, AttemptOutcome::Success);
        assert_eq!(s.record_attempt(record), None);
        assert!(s.attempts.is_empty());
        assert_eq!(s.finished_at, Some(now));
    }

    #[test]
    fn test_consecutive_slot_taken_resets() {
        let mut s = status(WindowPolicy::Unbounded);
        let taken = attempt(&s, 1, AttemptOutcome::SlotTaken);
        assert_eq!(s.record_attempt(taken.clone()), Some(1));
        assert_eq!(s.record_attempt(taken), Some(2));
        let network = attempt(&s, 3, AttemptOutcome::NetworkError);
        assert_eq!(s.record_attempt(network), Some(0));
        assert_eq!(s.last_error, Some(ErrorClass::Network));
    }

    #[test]
    fn test_remaining_window_and_attempts() {
        let mut s = status(WindowPolicy::Bounded(Duration::from_secs(60)));
        let now = Utc::now();
        assert_eq!(s.remaining_window_ms(now), Some(60_000));
        assert_eq!(s.remaining_attempts(now), Some(3));

        s.window_deadline = Some(now + TimeDelta::milliseconds(2500));
        assert_eq!(s.remaining_window_ms(now), Some(2500));
        assert_eq!(s.remaining_attempts(now), Some(3));

        s.max_consecutive_slot_taken = None;
        assert_eq!(s.remaining_attempts(now), Some(3));
        s.window_deadline = Some(now + TimeDelta::milliseconds(1500));
        assert_eq!(s.remaining_attempts(now), Some(2));

        let unbounded = status(WindowPolicy::Unbounded);
        assert_eq!(unbounded.remaining_window_ms(now), None);
    }

    #[test]
    fn test_summary_keeps_last_attempts() {
        let mut s = status(WindowPolicy::Unbounded);
        for seq in 1..=5 {
            let record = attempt(&s, seq, AttemptOutcome::NetworkError);
            s.record_attempt(record);
        }
        let summary = s.summary(Utc::now(), 2);
        assert_eq!(summary.attempt_count, 5);
        let sequences: Vec<u32> = summary.recent_attempts.iter().map(|a| a.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);
    }
}
