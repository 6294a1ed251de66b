use std::path::PathBuf;

use anyhow::{Context, Result};

use slotrush::config::Config;
use slotrush::engine::Engine;
use slotrush::export;
use slotrush::metrics;
use slotrush::scheduler::{RunPhase, RunRequest};

use super::TargetArgs;

/// Parameters for a foreground run
pub struct RunParams {
    pub target: TargetArgs,
    pub manual: bool,
    pub export: Option<PathBuf>,
    pub samples_export: Option<PathBuf>,
}

/// Run one target in the foreground until it reaches a terminal phase
pub async fn run(config: Config, params: RunParams) -> Result<()> {
    let RunParams {
        target,
        manual,
        export,
        samples_export,
    } = params;

    let target = target.into_target()?;
    let request = if manual {
        RunRequest::manual(target)
    } else {
        RunRequest::new(target)
    };

    metrics::init_metrics().context("Failed to register metrics")?;
    let engine = Engine::from_config(config).context("Failed to build engine")?;
    let workers = engine.start_background().await;

    let offset = engine.clock.current_offset();
    println!("Starting reservation run");
    println!("========================");
    println!("  Target: {}", request.target.key());
    println!("  Mode: {}", if manual { "immediate" } else { "automatic" });
    if let Some(at) = request.target.scheduled_instant {
        println!("  Fire at: {at}");
    }
    println!("  Clock offset: {}ms (stale: {})", offset.offset_ms, offset.stale);
    println!("  Session: {:?}", engine.session.freshness());
    println!();

    let run_id = engine.scheduler.start(request).await?;
    println!("Run {run_id} armed. Press Ctrl+C to cancel.\n");

    let phase = tokio::select! {
        phase = engine.scheduler.wait(run_id) => phase?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(%run_id, "Cancelling run on Ctrl+C");
            engine.scheduler.cancel(run_id).await?;
            engine.scheduler.wait(run_id).await?
        }
    };

    let status = engine.scheduler.snapshot(run_id).await?;
    println!("Run finished: {phase}");
    if let Some(reason) = status.terminal_reason {
        println!("  Reason: {reason:?}");
    }
    println!("  Attempts: {}", status.attempts.len());
    println!("  Polls: {}", status.poll_count);
    if let Some(last) = status.attempts.last() {
        println!(
            "  Last attempt: #{} {} ({}ms)",
            last.sequence, last.outcome, last.latency_ms
        );
    }
    if let Some(error) = status.last_error {
        println!(
            "  Last error: {} {}",
            error.as_str(),
            status.last_error_detail.as_deref().unwrap_or("")
        );
    }

    let runs = [status];
    if let Some(path) = export {
        let rows = export::export_attempts_to_file(&path, &runs)?;
        println!("  Exported {rows} attempts to {}", path.display());
    }
    if let Some(path) = samples_export {
        let rows = export::export_samples_to_file(&path, &runs)?;
        println!("  Exported {rows} samples to {}", path.display());
    }

    engine.shutdown().await;
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Background worker ended abnormally");
        }
    }

    if phase != RunPhase::Succeeded {
        anyhow::bail!("Run ended without a reservation ({phase})");
    }
    Ok(())
}
