//! slotrush - time-precision reservation engine
//!
//! Races for a timed-entry slot: aligns local timing with the ticketing
//! server's clock, keeps the session credential fresh, watches availability
//! and fires a bounded burst of reservation attempts at the right instant.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`client`] - HTTP client and the endpoint traits the engine talks through
//! - [`clock`] - Server clock offset estimation and corrected time
//! - [`session`] - Session token guard, credential file and validity monitor
//! - [`poller`] - Availability polling and classification
//! - [`submission`] - One reservation attempt and its outcome
//! - [`adjust`] - Per-pavilion slot label offsets and calibration
//! - [`scheduler`] - Run state machine: trigger, wait and burst
//! - [`notifications`] - Success notifications
//! - [`export`] - CSV export of attempts and samples
//! - [`control`] - Local HTTP control interface
//! - [`engine`] - Wiring of all of the above
//!
//! # Example
//!
//! ```no_run
//! use chrono::NaiveDate;
//! use slotrush::config::Config;
//! use slotrush::engine::Engine;
//! use slotrush::models::Target;
//! use slotrush::scheduler::RunRequest;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let engine = Engine::from_config(config)?;
//!     let _workers = engine.start_background().await;
//!
//!     let target = Target {
//!         pavilion_id: "H1H9".to_string(),
//!         date: NaiveDate::from_ymd_opt(2025, 10, 13).unwrap_or_default(),
//!         event_code: "H1H9".to_string(),
//!         channel: 5,
//!         scheduled_instant: None,
//!         ticket_ids: vec!["T1".to_string()],
//!         start_time: Some("1845".parse()?),
//!     };
//!     let run_id = engine.scheduler.start(RunRequest::new(target)).await?;
//!     let phase = engine.scheduler.wait(run_id).await?;
//!     println!("run {run_id} finished: {phase}");
//!     Ok(())
//! }
//! ```

pub mod adjust;
pub mod client;
pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod export;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod poller;
pub mod scheduler;
pub mod session;
pub mod submission;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{Collaborators, Engine};
    pub use crate::error::{Error, ErrorClass, Result, SlotrushErrorTrait};
    pub use crate::models::{
        AttemptOutcome, AttemptRecord, PollSample, PollStatus, SlotTime, Target, TargetKey,
        TriggerMode,
    };
    pub use crate::scheduler::{ReservationScheduler, RunPhase, RunRequest, RunSummary};
}

// Direct re-exports for convenience
pub use models::{SlotTime, Target, TriggerMode};
