use anyhow::{Context, Result};

use slotrush::config::Config;
use slotrush::control::ControlServer;
use slotrush::engine::Engine;
use slotrush::metrics;

/// Start the control interface with the clock refresher and session monitor
pub async fn serve(config: Config) -> Result<()> {
    println!("Starting slotrush control server");
    println!("================================");
    println!("  Credential file: {}", config.session.credential_file.display());
    println!(
        "  Scheduled window: {}s | Availability window: {}s",
        config.scheduler.scheduled_window_secs, config.scheduler.availability_window_secs
    );
    println!("  Attempt interval: {}ms", config.scheduler.attempt_interval_ms);
    println!(
        "  Webhook: {}",
        if config.notifications.webhook_url.is_some() {
            "configured"
        } else {
            "disabled"
        }
    );
    println!();

    metrics::init_metrics().context("Failed to register metrics")?;

    let engine = Engine::from_config(config).context("Failed to build engine")?;
    let workers = engine.start_background().await;

    let server = ControlServer::new(&engine);
    println!("{}", server.info().display());
    println!();
    println!("API Endpoints:");
    println!("  GET  /api/health               - Health check");
    println!("  GET  /api/status               - Runs, clock and session");
    println!("  POST /api/runs                 - Configure and start a run");
    println!("  GET  /api/runs                 - List runs");
    println!("  GET  /api/runs/{{id}}            - Run detail (?limit=N)");
    println!("  POST /api/runs/{{id}}/cancel     - Cancel a run");
    println!("  GET  /api/clock                - Clock offset");
    println!("  POST /api/clock/measure        - Re-measure the offset");
    println!("  GET  /api/session              - Session freshness");
    println!("  POST /api/session/check        - Validate the session");
    println!("  PUT  /api/session/token        - Install a new token");
    println!("  GET  /api/export/attempts.csv  - Attempt history");
    println!("  GET  /api/export/samples.csv   - Poll samples");
    println!("  POST /api/notifications/test   - Send a test notification");
    println!("  GET  /metrics                  - Prometheus metrics");
    println!();
    println!("Press Ctrl+C to stop.\n");

    server
        .start_with_shutdown(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => tracing::error!("Failed to wait for Ctrl+C: {}", e),
            }
        })
        .await?;

    engine.shutdown().await;
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Background worker ended abnormally");
        }
    }

    println!("Control server stopped.");
    Ok(())
}
