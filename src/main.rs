use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slotrush::config::Config;

mod commands;

use commands::{CalibrateParams, RunParams, TargetArgs};

#[derive(Parser)]
#[command(
    name = "slotrush",
    version,
    about = "Time-precision reservation engine for timed-entry slots",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (defaults to SLOTRUSH_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the local control interface and background workers
    Serve,

    /// Run one target in the foreground until it finishes
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// Skip the trigger and start bursting immediately
        #[arg(long, default_value = "false")]
        manual: bool,

        /// Write the attempt history to this CSV file
        #[arg(long)]
        export: Option<PathBuf>,

        /// Write the poll samples to this CSV file
        #[arg(long)]
        export_samples: Option<PathBuf>,
    },

    /// Measure and print the server clock offset
    Clock {
        /// Probes to take (overrides the configured count)
        #[arg(short, long)]
        samples: Option<u32>,
    },

    /// Validate the stored session credential
    CheckSession {
        /// Run the refresh command when the session is not valid
        #[arg(long, default_value = "false")]
        refresh: bool,
    },

    /// Probe which slot label the reservation endpoint expects
    Calibrate {
        #[command(flatten)]
        target: TargetArgs,

        /// Largest backwards shift to try, in minutes
        #[arg(long, default_value = "30")]
        max_minutes: i32,

        /// Shift step, in minutes
        #[arg(long, default_value = "5")]
        step_minutes: i32,

        /// Adjustment file to update with the result
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(config_file = ?cli.config, "Configuration loaded");

    match cli.command {
        Commands::Serve => {
            tracing::info!(bind = %config.server.bind_address, "Starting serve command");
            commands::serve(config).await?;
        }

        Commands::Run {
            target,
            manual,
            export,
            export_samples,
        } => {
            tracing::info!(
                pavilion = %target.pavilion,
                date = %target.date,
                manual = %manual,
                export = ?export,
                "Starting run command"
            );
            commands::run(
                config,
                RunParams {
                    target,
                    manual,
                    export,
                    samples_export: export_samples,
                },
            )
            .await?;
        }

        Commands::Clock { samples } => {
            tracing::info!(samples = ?samples, "Starting clock command");
            commands::clock(config, samples).await?;
        }

        Commands::CheckSession { refresh } => {
            tracing::info!(refresh = %refresh, "Starting check-session command");
            commands::check_session(config, refresh).await?;
        }

        Commands::Calibrate {
            target,
            max_minutes,
            step_minutes,
            save,
        } => {
            tracing::info!(
                pavilion = %target.pavilion,
                max_minutes = %max_minutes,
                step_minutes = %step_minutes,
                "Starting calibrate command"
            );
            commands::calibrate(
                config,
                CalibrateParams {
                    target,
                    max_minutes,
                    step_minutes,
                    save,
                },
            )
            .await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => tracing_subscriber::EnvFilter::new("slotrush=debug,info"),
        Err(_) => tracing_subscriber::EnvFilter::new("slotrush=info,warn"),
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        "text" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        other => anyhow::bail!("Unknown log format '{other}', expected text or json"),
    }

    Ok(())
}
