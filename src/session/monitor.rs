//! Background session validity monitor
//!
//! Checks the current token against the account endpoint on an interval,
//! records invalid-session events, and renews the token when it is rejected,
//! about to expire, or when a worker asks for a refresh. Renewal runs the
//! optional external login command and re-reads the credential file.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::{CredentialStore, SessionError, SessionFreshness, SessionGuard};
use crate::client::SessionProbe;
use crate::config::SessionConfig;

// ============================================================================
// Status Types
// ============================================================================

/// Result of one validity check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCheck {
    Valid,
    Invalid { status: u16 },
    /// Endpoint answered but not about the token (throttling, 5xx)
    Degraded { status: u16 },
    Missing,
    Unreachable,
}

impl SessionCheck {
    /// Whether the token itself needs renewing
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Self::Invalid { .. } | Self::Missing)
    }
}

/// Logged when the endpoint rejects the token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidSessionEvent {
    pub at: DateTime<Utc>,
    pub status: u16,
    pub token_preview: String,
}

/// Monitor state exposed to the control interface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_result: Option<SessionCheck>,
    pub refreshes: u64,
    pub last_refresh_error: Option<String>,
    pub invalid_log: VecDeque<InvalidSessionEvent>,
}

// ============================================================================
// Session Monitor
// ============================================================================

pub struct SessionMonitor {
    guard: Arc<SessionGuard>,
    probe: Arc<dyn SessionProbe>,
    store: CredentialStore,
    config: SessionConfig,
    status: RwLock<MonitorStatus>,
}

impl SessionMonitor {
    pub fn new(
        guard: Arc<SessionGuard>,
        probe: Arc<dyn SessionProbe>,
        store: CredentialStore,
        config: SessionConfig,
    ) -> Self {
        Self {
            guard,
            probe,
            store,
            config,
            status: RwLock::new(MonitorStatus::default()),
        }
    }

    pub fn guard(&self) -> &Arc<SessionGuard> {
        &self.guard
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub async fn status(&self) -> MonitorStatus {
        self.status.read().await.clone()
    }

    /// Check the current token against the account endpoint
    ///
    /// Only a 401 rejects the token: it is invalidated on the guard, which in
    /// turn wakes the monitor loop to renew it. Other statuses and transport
    /// failures leave the token untouched.
    pub async fn check_once(&self) -> SessionCheck {
        let result = match self.guard.current_token() {
            None => SessionCheck::Missing,
            Some(session) => match self.probe.check_session(&session).await {
                Ok(200) => SessionCheck::Valid,
                Ok(status @ 401) => {
                    self.record_invalid(status, session.token_preview()).await;
                    self.guard
                        .invalidate(format!("account check returned {status}"));
                    SessionCheck::Invalid { status }
                }
                Ok(status) => {
                    tracing::warn!(status, "Session check got a non-auth failure, keeping token");
                    SessionCheck::Degraded { status }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Session check failed to reach endpoint");
                    SessionCheck::Unreachable
                }
            },
        };

        let mut status = self.status.write().await;
        status.last_check = Some(Utc::now());
        status.last_result = Some(result);
        tracing::debug!(result = ?result, "Session check complete");
        result
    }

    async fn record_invalid(&self, status_code: u16, token_preview: String) {
        let mut status = self.status.write().await;
        status.invalid_log.push_back(InvalidSessionEvent {
            at: Utc::now(),
            status: status_code,
            token_preview,
        });
        while status.invalid_log.len() > self.config.invalid_log_limit {
            status.invalid_log.pop_front();
        }
    }

    /// Renew the token: run the refresh command if any, then re-read the file
    ///
    /// Returns `true` when a different token was installed.
    pub async fn refresh_once(&self) -> Result<bool, SessionError> {
        let command_result = match &self.config.refresh_command {
            Some(command) => self.run_refresh_command(command).await,
            None => Ok(()),
        };

        let loaded = self.guard.load_from(&self.store).await;

        let mut status = self.status.write().await;
        match (command_result, loaded) {
            (_, Ok(Some(session))) => {
                status.refreshes += 1;
                status.last_refresh_error = None;
                tracing::info!(generation = session.generation, "Session renewed from credential file");
                Ok(true)
            }
            (Err(e), _) | (Ok(()), Err(e)) => {
                status.last_refresh_error = Some(e.to_string());
                Err(e)
            }
            (Ok(()), Ok(None)) => Ok(false),
        }
    }

    async fn run_refresh_command(&self, command: &[String]) -> Result<(), SessionError> {
        let Some((program, args)) = command.split_first() else {
            return Err(SessionError::RefreshCommand("empty command".to_string()));
        };

        tracing::info!(program = %program, "Running session refresh command");
        let timeout = self.config.refresh_timeout();
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => Err(SessionError::RefreshTimeout(timeout)),
            Ok(Err(e)) => Err(SessionError::RefreshCommand(e.to_string())),
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(SessionError::RefreshCommand(format!(
                    "exit status {}: {}",
                    output.status,
                    stderr.trim()
                )))
            }
        }
    }

    /// Run the monitor until shutdown
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.status.write().await.running = true;
            tracing::info!(
                interval_secs = self.config.check_interval_secs,
                "Session monitor started"
            );

            let interval: Duration = self.config.check_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let check = self.check_once().await;
                        let needs_refresh = matches!(check, SessionCheck::Missing)
                            || matches!(
                                self.guard.freshness(),
                                SessionFreshness::Expiring | SessionFreshness::Expired
                            );
                        if needs_refresh {
                            self.refresh_logged().await;
                        }
                    }
                    _ = self.guard.refresh_requested() => {
                        self.refresh_logged().await;
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }

            self.status.write().await.running = false;
            tracing::info!("Session monitor stopped");
        })
    }

    async fn refresh_logged(&self) {
        match self.refresh_once().await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Session refresh produced no new token"),
            Err(e) => tracing::warn!(error = %e, "Session refresh failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FetchError;
    use crate::clock::SystemClock;
    use crate::models::Session;
    use async_trait::async_trait;

    struct StaticProbe(Result<u16, ()>);

    #[async_trait]
    impl SessionProbe for StaticProbe {
        async fn check_session(&self, _session: &Session) -> Result<u16, FetchError> {
            self.0.map_err(|_| FetchError::Timeout)
        }
    }

    fn monitor(probe: StaticProbe, store: CredentialStore, limit: usize) -> SessionMonitor {
        let guard = Arc::new(SessionGuard::new(
            Arc::new(SystemClock),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        ));
        let config = SessionConfig {
            invalid_log_limit: limit,
            ..SessionConfig::default()
        };
        SessionMonitor::new(guard, Arc::new(probe), store, config)
    }

    #[tokio::test]
    async fn test_check_without_session_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(StaticProbe(Ok(200)), CredentialStore::new(dir.path().join("c")), 10);
        assert_eq!(m.check_once().await, SessionCheck::Missing);
    }

    #[tokio::test]
    async fn test_rejected_token_is_invalidated_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(StaticProbe(Ok(401)), CredentialStore::new(dir.path().join("c")), 2);
        m.guard().refresh("session_id=abc").unwrap();

        for _ in 0..3 {
            m.guard().refresh("session_id=abc").unwrap();
            assert_eq!(m.check_once().await, SessionCheck::Invalid { status: 401 });
        }

        assert_eq!(m.guard().freshness(), SessionFreshness::Invalidated);
        let status = m.status().await;
        assert_eq!(status.invalid_log.len(), 2);
        assert_eq!(status.last_result, Some(SessionCheck::Invalid { status: 401 }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_keeps_token() {
        let dir = tempfile::tempdir().unwrap();
        let m = monitor(StaticProbe(Err(())), CredentialStore::new(dir.path().join("c")), 10);
        m.guard().refresh("session_id=abc").unwrap();

        assert_eq!(m.check_once().await, SessionCheck::Unreachable);
        assert!(m.guard().current_token().is_some());
    }

    #[tokio::test]
    async fn test_server_errors_keep_token() {
        let dir = tempfile::tempdir().unwrap();
        for code in [503, 429, 403] {
            let m = monitor(StaticProbe(Ok(code)), CredentialStore::new(dir.path().join("c")), 10);
            m.guard().refresh("session_id=abc").unwrap();

            let check = m.check_once().await;
            assert_eq!(check, SessionCheck::Degraded { status: code });
            assert!(!check.needs_refresh());
            assert_eq!(m.guard().current_token().unwrap().token, "session_id=abc");
            assert_eq!(m.guard().freshness(), SessionFreshness::Fresh);
            assert!(m.status().await.invalid_log.is_empty());
        }
    }

    #[tokio::test]
    async fn test_refresh_once_reads_new_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookie.txt"));
        let m = monitor(StaticProbe(Ok(200)), store.clone(), 10);

        assert!(!m.refresh_once().await.unwrap());

        store.write_token("session_id=new").await.unwrap();
        assert!(m.refresh_once().await.unwrap());
        assert_eq!(m.status().await.refreshes, 1);
        assert_eq!(m.guard().current_token().unwrap().token, "session_id=new");
    }
}
