//! Prometheus metrics for the reservation engine
//!
//! Tracks attempts by outcome, polls by status, finished runs by terminal
//! phase, active runs and the current clock offset.
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! Until then, and if registration fails, every recording call is a no-op.

use prometheus::{
    register_counter_vec, register_gauge, register_int_gauge, CounterVec, Encoder, Gauge,
    IntGauge, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

// ============================================================================
// Metrics Storage
// ============================================================================

struct EngineMetrics {
    attempts: CounterVec,
    polls: CounterVec,
    runs_finished: CounterVec,
    active_runs: IntGauge,
    clock_offset_ms: Gauge,
}

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

/// Serializes registration so concurrent callers never register twice
static INIT_LOCK: Mutex<()> = Mutex::new(());

// ============================================================================
// Initialization
// ============================================================================

/// Register all metrics with the default Prometheus registry
///
/// Safe to call more than once; later calls return `Ok(())` without
/// registering again.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if ENGINE_METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = EngineMetrics {
        attempts: register_counter_vec!(
            "slotrush_attempts_total",
            "Reservation attempts by outcome",
            &["outcome"]
        )?,
        polls: register_counter_vec!(
            "slotrush_polls_total",
            "Availability polls by classified status",
            &["status"]
        )?,
        runs_finished: register_counter_vec!(
            "slotrush_runs_finished_total",
            "Runs reaching a terminal phase",
            &["phase"]
        )?,
        active_runs: register_int_gauge!("slotrush_active_runs", "Runs not yet terminal")?,
        clock_offset_ms: register_gauge!(
            "slotrush_clock_offset_ms",
            "Last measured server clock offset in milliseconds"
        )?,
    };

    if ENGINE_METRICS.set(metrics).is_ok() {
        tracing::info!("Prometheus metrics initialized successfully");
    }
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    ENGINE_METRICS.get().is_some()
}

// ============================================================================
// Recording
// ============================================================================

pub fn record_attempt(outcome: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.attempts.with_label_values(&[outcome]).inc();
    }
}

pub fn record_poll(status: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.polls.with_label_values(&[status]).inc();
    }
}

pub fn record_run_started() {
    if let Some(m) = ENGINE_METRICS.get() {
        m.active_runs.inc();
    }
}

pub fn record_run_finished(phase: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.runs_finished.with_label_values(&[phase]).inc();
        m.active_runs.dec();
    }
}

pub fn set_clock_offset(offset_ms: i64) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.clock_offset_ms.set(offset_ms as f64);
    }
}

/// Render the default registry in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_after_init_shows_in_output() {
        init_metrics().unwrap();
        assert!(metrics_initialized());

        record_attempt("SLOT_TAKEN");
        record_poll("OPEN");
        set_clock_offset(-120);

        let output = gather_metrics();
        assert!(output.contains("slotrush_attempts_total"));
        assert!(output.contains("slotrush_polls_total"));
        assert!(output.contains("slotrush_clock_offset_ms"));
    }

    #[test]
    fn test_init_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }
}
