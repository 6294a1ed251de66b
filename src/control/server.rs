//! Control server implementation

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::api::create_router;
use crate::clock::ClockSync;
use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::notifications::Notifier;
use crate::scheduler::ReservationScheduler;
use crate::session::{SessionGuard, SessionMonitor};

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<ReservationScheduler>,
    pub clock: Arc<ClockSync>,
    pub session: Arc<SessionGuard>,
    pub monitor: Arc<SessionMonitor>,
    pub notifier: Option<Arc<dyn Notifier>>,
    /// Server start time
    pub start_time: Instant,
    /// Attempts returned per run when no `limit` is given
    pub default_attempt_limit: usize,
}

impl AppState {
    pub fn from_engine(engine: &Engine) -> Self {
        Self {
            scheduler: Arc::clone(&engine.scheduler),
            clock: Arc::clone(&engine.clock),
            session: Arc::clone(&engine.session),
            monitor: Arc::clone(&engine.monitor),
            notifier: engine.notifier.clone(),
            start_time: Instant::now(),
            default_attempt_limit: engine.config.server.default_attempt_limit,
        }
    }
}

// ============================================================================
// Control Server
// ============================================================================

pub struct ControlServer {
    config: ServerConfig,
    state: AppState,
}

impl ControlServer {
    pub fn new(engine: &Engine) -> Self {
        Self {
            config: engine.config.server.clone(),
            state: AppState::from_engine(engine),
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the router with all routes and layers
    pub fn build_router(&self) -> Router {
        let mut router = create_router(self.state.clone());

        if self.config.enable_cors {
            router = router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            );
        }

        if self.config.enable_request_logging {
            router = router.layer(TraceLayer::new_for_http());
        }

        router
    }

    /// Serve until `shutdown_signal` resolves, then cancel every live run
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let router = self.build_router();
        let addr = self.config.bind_address;

        tracing::info!(%addr, "Starting control server");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        let cancelled = self.state.scheduler.cancel_all().await;
        tracing::info!(cancelled_runs = cancelled, "Control server shutdown complete");
        Ok(())
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            bind_address: self.config.bind_address,
            cors_enabled: self.config.enable_cors,
            request_logging_enabled: self.config.enable_request_logging,
        }
    }
}

/// Server information
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub bind_address: SocketAddr,
    pub cors_enabled: bool,
    pub request_logging_enabled: bool,
}

impl ServerInfo {
    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Control Server\n\
             {:-<40}\n\
             Bind Address: {}\n\
             CORS: {}\n\
             Request Logging: {}",
            "",
            self.bind_address,
            if self.cors_enabled { "enabled" } else { "disabled" },
            if self.request_logging_enabled { "enabled" } else { "disabled" }
        )
    }
}

// ============================================================================
// Server Errors
// ============================================================================

#[derive(Debug, Clone)]
pub enum ServerError {
    /// Failed to bind to address
    BindError(String),
    /// Server error
    ServeError(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BindError(msg) => write!(f, "Failed to bind: {msg}"),
            Self::ServeError(msg) => write!(f, "Server error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn engine(enable_cors: bool) -> Engine {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.session.credential_file = dir.path().join("cookie.txt");
        config.server.enable_cors = enable_cors;
        Engine::from_config(config).unwrap()
    }

    #[test]
    fn test_server_info() {
        let server = ControlServer::new(&engine(true));
        let info = server.info();
        assert_eq!(info.bind_address.port(), 5000);
        assert!(info.cors_enabled);
        assert!(info.display().contains("CORS: enabled"));
    }

    #[test]
    fn test_server_without_cors() {
        let server = ControlServer::new(&engine(false));
        assert!(!server.info().cors_enabled);
        assert_eq!(server.state().default_attempt_limit, 20);
    }
}
