pub mod calibrate;
pub mod clock;
pub mod run;
pub mod serve;
pub mod session;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;

use slotrush::models::{compact_date, SlotTime, Target};

// Re-export command functions for convenience
pub use calibrate::{calibrate, CalibrateParams};
pub use clock::clock;
pub use run::{run, RunParams};
pub use serve::serve;
pub use session::check_session;

/// Target fields shared by `run` and `calibrate`
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Pavilion id used by the availability feed
    #[arg(short, long)]
    pub pavilion: String,

    /// Visit date (YYYYMMDD or YYYY-MM-DD)
    #[arg(short, long)]
    pub date: String,

    /// Event code for the reservation endpoint (defaults to the pavilion id)
    #[arg(short, long)]
    pub event: Option<String>,

    /// Registration channel
    #[arg(long, default_value = "5")]
    pub channel: u8,

    /// Ticket ids, comma separated
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub tickets: Vec<String>,

    /// Slot start time (HHMM)
    #[arg(short, long)]
    pub start_time: Option<String>,

    /// Authoritative-clock instant to fire at (RFC 3339)
    #[arg(long)]
    pub at: Option<String>,
}

impl TargetArgs {
    pub fn into_target(self) -> Result<Target> {
        let date = compact_date::parse(&self.date).map_err(anyhow::Error::msg)?;

        let start_time = self
            .start_time
            .as_deref()
            .map(str::parse::<SlotTime>)
            .transpose()
            .context("Invalid start time")?;

        let scheduled_instant = self
            .at
            .as_deref()
            .map(|raw| DateTime::parse_from_rfc3339(raw).map(|at| at.with_timezone(&Utc)))
            .transpose()
            .context("Invalid --at instant, expected RFC 3339")?;

        Ok(Target {
            event_code: self.event.unwrap_or_else(|| self.pavilion.clone()),
            pavilion_id: self.pavilion,
            date,
            channel: self.channel,
            scheduled_instant,
            ticket_ids: self.tickets,
            start_time,
        })
    }
}
