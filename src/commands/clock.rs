use anyhow::{Context, Result};

use slotrush::config::Config;
use slotrush::engine::Engine;

/// Measure the authoritative clock offset and print it
pub async fn clock(config: Config, samples: Option<u32>) -> Result<()> {
    let mut config = config;
    if let Some(samples) = samples {
        config.clock.samples = samples;
    }

    println!("Measuring server clock offset");
    println!("=============================");
    println!("  Server: {}", config.endpoints.base_url);
    println!("  Samples: {}", config.clock.samples);
    println!();

    let engine = Engine::from_config(config).context("Failed to build engine")?;
    let offset = engine.clock.measure().await;

    match offset.measured_at {
        Some(at) => {
            println!("Offset: {:+}ms (server ahead when positive)", offset.offset_ms);
            if let Some(rtt) = offset.rtt_ms {
                println!("Round trip: {rtt}ms");
            }
            println!("Measured at: {at}");
            println!("Local now:     {}", engine.clock.local_now());
            println!("Corrected now: {}", engine.clock.corrected_now());
        }
        None => {
            println!("No usable sample, offset left at 0ms and marked stale.");
        }
    }

    Ok(())
}
