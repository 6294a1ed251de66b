//! Scheduler timing and termination behaviour on paused tokio time

mod common;

use std::time::Duration;

use chrono::TimeDelta;

use common::*;
use slotrush::models::{AttemptOutcome, PollStatus, TriggerMode};
use slotrush::scheduler::{RunError, RunPhase, RunRequest, TerminalReason};

#[tokio::test(start_paused = true)]
async fn test_past_instant_bursts_immediately() {
    let h = Harness::new(
        scheduler_config(),
        0,
        ScriptedEndpoint::always(success()),
        ScriptedFeed::closed(),
    );
    let target = scheduled_target("H1H9", anchor() - TimeDelta::seconds(10));

    let id = h.scheduler.start(RunRequest::new(target)).await.unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Succeeded);

    let status = h.scheduler.snapshot(id).await.unwrap();
    assert_eq!(status.attempts.len(), 1);
    assert!(h.elapsed_ms(status.attempts[0].timestamp) < 50);
}

#[tokio::test(start_paused = true)]
async fn test_fires_at_offset_corrected_instant() {
    // Server runs 500ms ahead, so local fire time is 500ms before the instant
    let h = Harness::new(
        scheduler_config(),
        500,
        ScriptedEndpoint::always(success()),
        ScriptedFeed::closed(),
    );
    h.clock.measure().await;
    assert_eq!(h.clock.current_offset().offset_ms, 500);

    let at = anchor() + TimeDelta::seconds(10);
    let id = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", at)))
        .await
        .unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Succeeded);

    let status = h.scheduler.snapshot(id).await.unwrap();
    let fired_ms = h.elapsed_ms(status.attempts[0].timestamp);
    assert!(fired_ms >= 9_500, "fired early at {fired_ms}ms");
    assert!(fired_ms <= 9_510, "fired late at {fired_ms}ms");
}

#[tokio::test(start_paused = true)]
async fn test_success_stops_further_attempts() {
    let endpoint = ScriptedEndpoint::new(vec![slot_taken(), slot_taken(), success()], slot_taken());
    let h = Harness::new(scheduler_config(), 0, endpoint, ScriptedFeed::closed());

    let target = scheduled_target("H1H9", anchor());
    let id = h.scheduler.start(RunRequest::new(target)).await.unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Succeeded);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.endpoint.call_count(), 3);

    let status = h.scheduler.snapshot(id).await.unwrap();
    let outcomes: Vec<_> = status.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::SlotTaken, AttemptOutcome::SlotTaken, AttemptOutcome::Success]
    );
    assert_eq!(status.terminal_reason, Some(TerminalReason::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_window_elapses_after_slot_taken_burst() {
    let h = Harness::new(
        scheduler_config(),
        0,
        ScriptedEndpoint::always(slot_taken()),
        ScriptedFeed::closed(),
    );

    let target = scheduled_target("H1H9", anchor());
    let id = h.scheduler.start(RunRequest::new(target)).await.unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Exhausted);

    let status = h.scheduler.snapshot(id).await.unwrap();
    assert_eq!(status.terminal_reason, Some(TerminalReason::WindowElapsed));
    let attempts = status.attempts.len();
    assert!((59..=61).contains(&attempts), "got {attempts} attempts");
    assert_eq!(status.consecutive_slot_taken as usize, attempts);
}

#[tokio::test(start_paused = true)]
async fn test_slot_taken_limit_ends_burst() {
    let config = slotrush::config::SchedulerConfig {
        max_consecutive_slot_taken: Some(5),
        ..scheduler_config()
    };
    let h = Harness::new(
        config,
        0,
        ScriptedEndpoint::always(slot_taken()),
        ScriptedFeed::closed(),
    );

    let id = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", anchor())))
        .await
        .unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Exhausted);

    let status = h.scheduler.snapshot(id).await.unwrap();
    assert_eq!(status.attempts.len(), 5);
    assert_eq!(status.terminal_reason, Some(TerminalReason::SlotTakenLimit));
}

#[tokio::test(start_paused = true)]
async fn test_parameter_error_ends_burst_immediately() {
    let h = Harness::new(
        scheduler_config(),
        0,
        ScriptedEndpoint::always(parameter_error()),
        ScriptedFeed::closed(),
    );

    let id = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", anchor())))
        .await
        .unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Exhausted);

    let status = h.scheduler.snapshot(id).await.unwrap();
    assert_eq!(status.attempts.len(), 1);
    assert_eq!(status.attempts[0].outcome, AttemptOutcome::ParameterError);
    assert_eq!(status.terminal_reason, Some(TerminalReason::ParameterRejected));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_targets_keep_their_own_sequence() {
    let config = slotrush::config::SchedulerConfig {
        attempt_interval_ms: 500,
        scheduled_window_secs: 5,
        ..scheduler_config()
    };
    let h = Harness::new(
        config,
        0,
        ScriptedEndpoint::always(slot_taken()),
        ScriptedFeed::closed(),
    );

    let first = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", anchor())))
        .await
        .unwrap();
    let second = h
        .scheduler
        .start(RunRequest::new(scheduled_target("C5G0", anchor())))
        .await
        .unwrap();

    assert_eq!(h.scheduler.wait(first).await.unwrap(), RunPhase::Exhausted);
    assert_eq!(h.scheduler.wait(second).await.unwrap(), RunPhase::Exhausted);

    for id in [first, second] {
        let status = h.scheduler.snapshot(id).await.unwrap();
        let sequences: Vec<u32> = status.attempts.iter().map(|a| a.sequence).collect();
        let expected: Vec<u32> = (1..=sequences.len() as u32).collect();
        assert_eq!(sequences, expected);
        assert!(status.attempts.iter().all(|a| a.target == status.key));
    }

    let calls = h.endpoint.calls();
    assert!(calls.iter().any(|c| c.payload.event_code == "H1H9"));
    assert!(calls.iter().any(|c| c.payload.event_code == "C5G0"));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_target_is_rejected() {
    let h = Harness::new(
        scheduler_config(),
        0,
        ScriptedEndpoint::always(slot_taken()),
        ScriptedFeed::closed(),
    );
    let at = anchor() + TimeDelta::minutes(10);

    let id = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", at)))
        .await
        .unwrap();
    let err = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", at)))
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::AlreadyActive { run_id, .. } if run_id == id));

    h.scheduler.cancel(id).await.unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Cancelled);

    // A finished run frees the target
    assert!(h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", at)))
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_issues_no_attempts() {
    let h = Harness::new(
        scheduler_config(),
        0,
        ScriptedEndpoint::always(success()),
        ScriptedFeed::closed(),
    );
    // Default lead is 3s, so the run is WAITING from 57s on
    let at = anchor() + TimeDelta::seconds(60);
    let id = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", at)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(58)).await;
    assert_eq!(h.scheduler.snapshot(id).await.unwrap().phase, RunPhase::Waiting);

    h.scheduler.cancel(id).await.unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Cancelled);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.endpoint.call_count(), 0);
    let status = h.scheduler.snapshot(id).await.unwrap();
    assert!(status.attempts.is_empty());
    assert_eq!(status.terminal_reason, Some(TerminalReason::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_finished_run_is_noop() {
    let h = Harness::new(
        scheduler_config(),
        0,
        ScriptedEndpoint::always(success()),
        ScriptedFeed::closed(),
    );
    let id = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", anchor())))
        .await
        .unwrap();
    h.scheduler.wait(id).await.unwrap();

    assert_eq!(h.scheduler.cancel(id).await.unwrap(), RunPhase::Succeeded);
    assert_eq!(h.scheduler.snapshot(id).await.unwrap().phase, RunPhase::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_auth_error_pauses_and_shifts_window() {
    let endpoint = ScriptedEndpoint::new(vec![slot_taken(), unauthorized()], slot_taken());
    let h = Harness::new(scheduler_config(), 0, endpoint, ScriptedFeed::closed());

    let id = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", anchor())))
        .await
        .unwrap();

    // Attempt 2 lands at 1s; the new token arrives 10s later
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(h.scheduler.snapshot(id).await.unwrap().paused_for_auth);
    assert_eq!(h.endpoint.call_count(), 2);
    h.session.refresh("token-2").unwrap();

    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Exhausted);
    let status = h.scheduler.snapshot(id).await.unwrap();
    assert_eq!(status.terminal_reason, Some(TerminalReason::WindowElapsed));
    assert_eq!(status.attempts[1].outcome, AttemptOutcome::AuthError);

    let attempts = status.attempts.len();
    assert!((58..=62).contains(&attempts), "got {attempts} attempts");

    // Window was extended by the pause, not restarted
    let last_ms = h.elapsed_ms(status.attempts.last().unwrap().timestamp);
    assert!((68_000..71_000).contains(&last_ms), "last attempt at {last_ms}ms");

    let calls = h.endpoint.calls();
    assert!(calls[2..].iter().all(|c| c.token == "token-2"));
}

#[tokio::test(start_paused = true)]
async fn test_auth_pause_times_out() {
    let config = slotrush::config::SchedulerConfig {
        auth_resume_timeout_secs: 5,
        ..scheduler_config()
    };
    let h = Harness::new(
        config,
        0,
        ScriptedEndpoint::always(unauthorized()),
        ScriptedFeed::closed(),
    );

    let id = h
        .scheduler
        .start(RunRequest::new(scheduled_target("H1H9", anchor())))
        .await
        .unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Exhausted);

    let status = h.scheduler.snapshot(id).await.unwrap();
    assert_eq!(status.attempts.len(), 1);
    assert_eq!(status.terminal_reason, Some(TerminalReason::AuthTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_availability_trigger_uses_feed_slot() {
    let closed = slotrush::client::RawResponse::new(200, r#"{"H1H9":[{"t":"1845","s":0}]}"#);
    let open = slotrush::client::RawResponse::new(
        200,
        r#"{"H1H9":[{"t":"1845","s":0},{"t":"1900","s":2},{"t":"1930","s":8}]}"#,
    );
    let feed = ScriptedFeed::new(vec![closed.clone(), closed], open);
    let h = Harness::new(scheduler_config(), 0, ScriptedEndpoint::always(success()), feed);

    let mut target = target("H1H9");
    target.start_time = None;
    let id = h.scheduler.start(RunRequest::new(target)).await.unwrap();
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Succeeded);

    let status = h.scheduler.snapshot(id).await.unwrap();
    assert_eq!(status.mode, TriggerMode::OnAvailability);
    assert_eq!(h.feed.poll_count(), 3);
    assert_eq!(status.samples.back().unwrap().status, PollStatus::Open);
    assert_eq!(status.slot_time.unwrap().as_hhmm(), "1930");
    assert_eq!(h.endpoint.calls()[0].payload.start_time, "1930");
}

#[tokio::test(start_paused = true)]
async fn test_manual_run_continues_until_cancelled() {
    let h = Harness::new(
        scheduler_config(),
        0,
        ScriptedEndpoint::always(slot_taken()),
        ScriptedFeed::closed(),
    );
    let id = h
        .scheduler
        .start(RunRequest::manual(target("H1H9")))
        .await
        .unwrap();

    // Well past any bounded window
    tokio::time::sleep(Duration::from_secs(120)).await;
    let status = h.scheduler.snapshot(id).await.unwrap();
    assert_eq!(status.phase, RunPhase::Bursting);
    assert!(status.attempts.len() >= 100);

    assert_eq!(h.scheduler.cancel_all().await, 1);
    assert_eq!(h.scheduler.wait(id).await.unwrap(), RunPhase::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_target_is_rejected() {
    let h = Harness::new(
        scheduler_config(),
        0,
        ScriptedEndpoint::always(success()),
        ScriptedFeed::closed(),
    );
    let mut target = scheduled_target("H1H9", anchor());
    target.start_time = None;

    let err = h.scheduler.start(RunRequest::new(target)).await.unwrap_err();
    assert!(matches!(err, RunError::InvalidTarget(_)));
    assert!(h.scheduler.list(10).await.is_empty());
}
