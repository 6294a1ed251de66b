//! Process-wide engine wiring
//!
//! [`Engine`] owns the single-writer state (clock offset, session) and the
//! scheduler, and starts the clock refresher and session monitor workers.
//! Both the control server and the one-shot CLI commands build one.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adjust::SlotAdjustments;
use crate::client::{AvailabilityFeed, ReservationEndpoint, ServerTimeSource, SessionProbe, TicketApi};
use crate::clock::{ClockSync, SystemClock, WallClock};
use crate::config::{Config, EndpointConfig};
use crate::error::Result;
use crate::notifications::{Notifier, WebhookConfig, WebhookNotifier};
use crate::scheduler::{EngineContext, ReservationScheduler};
use crate::session::{CredentialStore, SessionGuard, SessionMonitor};
use crate::submission::SubmissionAttempt;

/// Remote endpoints and the local clock the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub feed: Arc<dyn AvailabilityFeed>,
    pub endpoint: Arc<dyn ReservationEndpoint>,
    pub time_source: Arc<dyn ServerTimeSource>,
    pub probe: Arc<dyn SessionProbe>,
    pub wall: Arc<dyn WallClock>,
}

impl Collaborators {
    /// All four endpoints served by one HTTP client, on the system clock
    pub fn http(config: &EndpointConfig) -> Result<Self> {
        let api = Arc::new(TicketApi::new(config.clone())?);
        Ok(Self {
            feed: api.clone(),
            endpoint: api.clone(),
            time_source: api.clone(),
            probe: api,
            wall: Arc::new(SystemClock),
        })
    }
}

pub struct Engine {
    pub config: Config,
    pub clock: Arc<ClockSync>,
    pub session: Arc<SessionGuard>,
    pub monitor: Arc<SessionMonitor>,
    pub scheduler: Arc<ReservationScheduler>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub adjustments: Arc<SlotAdjustments>,
    endpoint: Arc<dyn ReservationEndpoint>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Build against the configured HTTP endpoints
    pub fn from_config(config: Config) -> Result<Self> {
        let parts = Collaborators::http(&config.endpoints)?;
        Self::new(config, parts)
    }

    pub fn new(config: Config, parts: Collaborators) -> Result<Self> {
        let clock = Arc::new(ClockSync::new(
            parts.time_source,
            Arc::clone(&parts.wall),
            config.clock.clone(),
        ));

        let session = Arc::new(SessionGuard::new(
            Arc::clone(&parts.wall),
            config.session.token_lifetime(),
            config.session.expiry_margin(),
        ));
        let store = CredentialStore::new(&config.session.credential_file);
        let monitor = Arc::new(SessionMonitor::new(
            Arc::clone(&session),
            parts.probe,
            store,
            config.session.clone(),
        ));

        let adjustments = Arc::new(SlotAdjustments::load_optional(
            config.adjustments.file.as_deref(),
        )?);
        let submission = Arc::new(SubmissionAttempt::new(
            Arc::clone(&parts.endpoint),
            Arc::clone(&adjustments),
            Arc::clone(&parts.wall),
        ));

        let notifier: Option<Arc<dyn Notifier>> =
            match WebhookConfig::from_config(&config.notifications) {
                Some(webhook) => Some(Arc::new(WebhookNotifier::new(webhook)?)),
                None => None,
            };

        let scheduler = Arc::new(ReservationScheduler::new(EngineContext {
            clock: Arc::clone(&clock),
            session: Arc::clone(&session),
            feed: parts.feed,
            submission,
            notifier: notifier.clone(),
            config: config.scheduler.clone(),
            poller: config.poller.clone(),
        }));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            clock,
            session,
            monitor,
            scheduler,
            notifier,
            adjustments,
            endpoint: parts.endpoint,
            shutdown_tx,
        })
    }

    /// Reservation endpoint, used directly by calibration
    pub fn endpoint(&self) -> Arc<dyn ReservationEndpoint> {
        Arc::clone(&self.endpoint)
    }

    /// Load the credential file, take a first clock measurement and spawn
    /// the background workers
    pub async fn start_background(&self) -> Vec<JoinHandle<()>> {
        match self.session.load_from(self.monitor.store()).await {
            Ok(Some(session)) => {
                tracing::info!(token = %session.token_preview(), "Loaded session credential")
            }
            Ok(None) => tracing::warn!(
                path = %self.monitor.store().path().display(),
                "No session credential found, waiting for one"
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to load session credential"),
        }

        self.clock.measure().await;

        let mut handles = vec![Arc::clone(&self.monitor).spawn(self.shutdown_tx.subscribe())];
        if let Some(interval) = self.config.clock.refresh_interval() {
            handles.push(Arc::clone(&self.clock).spawn_refresher(interval, self.shutdown_tx.subscribe()));
        }
        handles
    }

    /// Stop background workers and cancel every live run
    pub async fn shutdown(&self) {
        let cancelled = self.scheduler.cancel_all().await;
        self.shutdown_tx.send_replace(true);
        tracing::info!(cancelled_runs = cancelled, "Engine shutdown");
    }
}
