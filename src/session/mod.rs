//! Session credential ownership
//!
//! [`SessionGuard`] is the single writer of the session token. Readers get
//! an `Arc<Session>` snapshot from a `watch` channel, so a swap is atomic and
//! nobody observes a half-written token. Auth failures surfaced by the poller
//! or the submission path call [`SessionGuard::invalidate`], which wakes the
//! [`monitor::SessionMonitor`] to obtain a new token.

pub mod monitor;
pub mod store;

pub use monitor::{MonitorStatus, SessionCheck, SessionMonitor};
pub use store::CredentialStore;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};

use crate::clock::WallClock;
use crate::models::Session;

/// Errors raised while loading or renewing the session
#[derive(Error, Debug)]
pub enum SessionError {
    /// Credential file could not be read or written
    #[error("credential file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Token string was empty
    #[error("session token is empty")]
    EmptyToken,

    /// No session has been loaded
    #[error("no session available")]
    Missing,

    /// External refresh command failed
    #[error("refresh command failed: {0}")]
    RefreshCommand(String),

    /// External refresh command did not finish in time
    #[error("refresh command timed out after {0:?}")]
    RefreshTimeout(Duration),
}

impl SessionError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::EmptyToken)
    }
}

/// Freshness indicator exposed to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionFreshness {
    Fresh,
    Expiring,
    Expired,
    Invalidated,
    Missing,
}

#[derive(Debug, Clone, Default)]
struct GuardState {
    current: Option<Arc<Session>>,
    invalidated: Option<String>,
    generation: u64,
}

impl GuardState {
    fn usable(&self) -> Option<Arc<Session>> {
        match (&self.current, &self.invalidated) {
            (Some(session), None) => Some(Arc::clone(session)),
            _ => None,
        }
    }
}

/// Operator-facing view of the session, without the token itself
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub freshness: SessionFreshness,
    pub generation: u64,
    pub token_preview: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    pub estimated_expiry: Option<DateTime<Utc>>,
    pub invalidated_reason: Option<String>,
}

/// Holds the current session token
pub struct SessionGuard {
    state_tx: watch::Sender<GuardState>,
    refresh_signal: Notify,
    wall: Arc<dyn WallClock>,
    lifetime: Duration,
    expiry_margin: Duration,
}

impl SessionGuard {
    pub fn new(wall: Arc<dyn WallClock>, lifetime: Duration, expiry_margin: Duration) -> Self {
        let (state_tx, _) = watch::channel(GuardState::default());
        Self {
            state_tx,
            refresh_signal: Notify::new(),
            wall,
            lifetime,
            expiry_margin,
        }
    }

    /// Usable session, `None` when missing or invalidated
    pub fn current_token(&self) -> Option<Arc<Session>> {
        self.state_tx.borrow().usable()
    }

    /// Swap in a new token
    pub fn refresh(&self, token: impl Into<String>) -> Result<Arc<Session>, SessionError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(SessionError::EmptyToken);
        }

        let issued_at = self.wall.now();
        let lifetime = TimeDelta::from_std(self.lifetime).unwrap_or(TimeDelta::MAX);
        let mut installed = None;

        self.state_tx.send_modify(|state| {
            state.generation += 1;
            let session = Arc::new(Session {
                token,
                issued_at,
                estimated_expiry: issued_at + lifetime,
                generation: state.generation,
            });
            state.current = Some(Arc::clone(&session));
            state.invalidated = None;
            installed = Some(session);
        });

        let session = installed.ok_or(SessionError::Missing)?;
        tracing::info!(
            generation = session.generation,
            token = %session.token_preview(),
            "Session token refreshed"
        );
        Ok(session)
    }

    /// Mark the current token unusable and ask the monitor for a new one
    pub fn invalidate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut changed = false;
        self.state_tx.send_if_modified(|state| {
            if state.current.is_some() && state.invalidated.is_none() {
                state.invalidated = Some(reason.clone());
                changed = true;
            }
            changed
        });
        if changed {
            tracing::warn!(reason = %reason, "Session invalidated");
        }
        self.refresh_signal.notify_one();
    }

    /// Ask the monitor to renew without invalidating the current token
    pub fn request_refresh(&self) {
        self.refresh_signal.notify_one();
    }

    /// Resolves when a refresh has been requested
    pub async fn refresh_requested(&self) {
        self.refresh_signal.notified().await;
    }

    pub fn generation(&self) -> u64 {
        self.state_tx.borrow().generation
    }

    /// Wait until a usable token newer than `after_generation` is installed
    pub async fn wait_for_fresh(&self, after_generation: u64) -> Arc<Session> {
        let mut rx = self.state_tx.subscribe();
        loop {
            if let Some(session) = {
                let state = rx.borrow_and_update();
                state
                    .usable()
                    .filter(|_| state.generation > after_generation)
            } {
                return session;
            }
            // The sender lives as long as self, so this cannot fail while borrowed
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn freshness(&self) -> SessionFreshness {
        let state = self.state_tx.borrow();
        let Some(session) = &state.current else {
            return SessionFreshness::Missing;
        };
        if state.invalidated.is_some() {
            return SessionFreshness::Invalidated;
        }

        let now = self.wall.now();
        let margin = TimeDelta::from_std(self.expiry_margin).unwrap_or(TimeDelta::zero());
        if now >= session.estimated_expiry {
            SessionFreshness::Expired
        } else if now + margin >= session.estimated_expiry {
            SessionFreshness::Expiring
        } else {
            SessionFreshness::Fresh
        }
    }

    pub fn view(&self) -> SessionView {
        let freshness = self.freshness();
        let state = self.state_tx.borrow();
        SessionView {
            freshness,
            generation: state.generation,
            token_preview: state.current.as_ref().map(|s| s.token_preview()),
            issued_at: state.current.as_ref().map(|s| s.issued_at),
            estimated_expiry: state.current.as_ref().map(|s| s.estimated_expiry),
            invalidated_reason: state.invalidated.clone(),
        }
    }

    /// Load the token from the credential file
    ///
    /// Swaps only when the file holds a different token than the current
    /// one; re-reading the same rejected token keeps it invalidated.
    /// Returns the new session when a swap happened.
    pub async fn load_from(
        &self,
        store: &CredentialStore,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        let Some(token) = store.read_token().await? else {
            tracing::debug!(path = %store.path().display(), "Credential file is empty");
            return Ok(None);
        };

        let unchanged = self
            .state_tx
            .borrow()
            .current
            .as_ref()
            .is_some_and(|s| s.token == token);
        if unchanged {
            return Ok(None);
        }

        self.refresh(token).map(Some)
    }
}
