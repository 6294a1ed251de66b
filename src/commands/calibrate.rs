use std::path::PathBuf;

use anyhow::{Context, Result};

use slotrush::adjust::{self, CalibrationSettings, SlotAdjustments};
use slotrush::config::Config;
use slotrush::engine::Engine;

use super::TargetArgs;

/// Parameters for the slot-label calibration probe
pub struct CalibrateParams {
    pub target: TargetArgs,
    pub max_minutes: i32,
    pub step_minutes: i32,
    /// Adjustment file to update; falls back to the configured one
    pub save: Option<PathBuf>,
}

/// Probe backwards slot shifts until the endpoint recognises the label
pub async fn calibrate(config: Config, params: CalibrateParams) -> Result<()> {
    let CalibrateParams {
        target,
        max_minutes,
        step_minutes,
        save,
    } = params;

    let target = target.into_target()?;
    let base_slot = target
        .start_time
        .context("Calibration needs --start-time")?;
    let save_path = save.or_else(|| config.adjustments.file.clone());

    println!("Calibrating slot label for {}", target.pavilion_id);
    println!("===============================");
    println!("  Base slot: {base_slot}");
    println!("  Range: 0 to -{max_minutes} minutes, step {step_minutes}");
    println!();

    let engine = Engine::from_config(config).context("Failed to build engine")?;
    let session = engine
        .session
        .load_from(engine.monitor.store())
        .await
        .context("Failed to read credential file")?
        .context("No session credential available")?;

    let settings = CalibrationSettings {
        max_minutes,
        step_minutes,
        ..Default::default()
    };
    let endpoint = engine.endpoint();
    let report = adjust::calibrate(endpoint.as_ref(), &target, base_slot, &session, &settings).await;

    for (offset, outcome) in &report.tried {
        println!("  {:+4} min -> {}", offset, outcome);
    }
    match report.confirmed_offset {
        Some(offset) => println!("\nConfirmed offset: {offset:+} minutes"),
        None => println!("\nNo label confirmed, keeping 0"),
    }

    if let Some(path) = save_path {
        let mut adjustments = SlotAdjustments::load_optional(Some(&path))?;
        adjustments.set(target.pavilion_id.clone(), report.offset());
        adjustments.save(&path)?;
        println!("Saved adjustment to {}", path.display());
    }

    Ok(())
}
