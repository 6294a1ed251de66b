//! REST API handlers for the control interface

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::server::AppState;
use crate::export;
use crate::metrics;
use crate::models::ClockOffset;
use crate::scheduler::{RunError, RunPhase, RunRequest, RunSummary};
use crate::session::{MonitorStatus, SessionCheck, SessionView};

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

fn run_error_response(err: RunError) -> Response {
    let status = match &err {
        RunError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
        RunError::AlreadyActive { .. } | RunError::InvalidTransition { .. } => StatusCode::CONFLICT,
        RunError::NotFound(_) => StatusCode::NOT_FOUND,
    };
    error_response(status, err.to_string())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub active_runs: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClockView {
    pub offset: ClockOffset,
    pub local_now: DateTime<Utc>,
    pub corrected_now: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: SessionView,
    pub monitor: MonitorStatus,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub runs: Vec<RunSummary>,
    pub clock: ClockView,
    pub session: SessionView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub run: RunSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub run_id: Uuid,
    /// Phase when the cancel was requested
    pub phase: RunPhase,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub result: SessionCheck,
    pub session: SessionView,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub token: String,
    /// Also write the token to the credential file
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_persist() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct TestNotificationRequest {
    #[serde(default)]
    pub message: Option<String>,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and overview
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        // Runs
        .route("/api/runs", post(start_run).get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        // Clock
        .route("/api/clock", get(get_clock))
        .route("/api/clock/measure", post(measure_clock))
        // Session
        .route("/api/session", get(get_session))
        .route("/api/session/check", post(check_session))
        .route("/api/session/token", put(put_session_token))
        // Export
        .route("/api/export/attempts.csv", get(export_attempts))
        .route("/api/export/samples.csv", get(export_samples))
        // Notifications and metrics
        .route("/api/notifications/test", post(test_notification))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

// ============================================================================
// Health Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_runs: state.scheduler.active_count().await,
    }))
}

fn clock_view(state: &AppState) -> ClockView {
    ClockView {
        offset: state.clock.current_offset(),
        local_now: state.clock.local_now(),
        corrected_now: state.clock.corrected_now(),
    }
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let runs = state.scheduler.list(state.default_attempt_limit).await;
    Json(ApiResponse::success(StatusResponse {
        runs,
        clock: clock_view(&state),
        session: state.session.view(),
    }))
}

// ============================================================================
// Run Handlers
// ============================================================================

async fn start_run(State(state): State<AppState>, Json(request): Json<RunRequest>) -> Response {
    let run_id = match state.scheduler.start(request).await {
        Ok(run_id) => run_id,
        Err(e) => return run_error_response(e),
    };

    match state.scheduler.status(run_id, state.default_attempt_limit).await {
        Ok(run) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(StartRunResponse { run_id, run })),
        )
            .into_response(),
        Err(e) => run_error_response(e),
    }
}

async fn list_runs(State(state): State<AppState>, Query(query): Query<LimitQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(state.default_attempt_limit);
    Json(ApiResponse::success(state.scheduler.list(limit).await))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(state.default_attempt_limit);
    match state.scheduler.status(run_id, limit).await {
        Ok(run) => Json(ApiResponse::success(run)).into_response(),
        Err(e) => run_error_response(e),
    }
}

async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    match state.scheduler.cancel(run_id).await {
        Ok(phase) => Json(ApiResponse::success(CancelResponse { run_id, phase })).into_response(),
        Err(e) => run_error_response(e),
    }
}

// ============================================================================
// Clock Handlers
// ============================================================================

async fn get_clock(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(clock_view(&state)))
}

async fn measure_clock(State(state): State<AppState>) -> impl IntoResponse {
    state.clock.measure().await;
    Json(ApiResponse::success(clock_view(&state)))
}

// ============================================================================
// Session Handlers
// ============================================================================

async fn get_session(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(SessionResponse {
        session: state.session.view(),
        monitor: state.monitor.status().await,
    }))
}

async fn check_session(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.monitor.check_once().await;
    Json(ApiResponse::success(CheckResponse {
        result,
        session: state.session.view(),
    }))
}

async fn put_session_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Response {
    // Install first so a rejected token never reaches the credential file
    let session = match state.session.refresh(request.token) {
        Ok(session) => session,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    if request.persist {
        if let Err(e) = state.monitor.store().write_token(&session.token).await {
            tracing::error!(error = %e, "Failed to persist session token");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    Json(ApiResponse::success(state.session.view())).into_response()
}

// ============================================================================
// Export Handlers
// ============================================================================

fn csv_response(body: crate::error::Result<String>) -> Response {
    match body {
        Ok(body) => ([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "CSV export failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn export_attempts(State(state): State<AppState>) -> Response {
    let runs = state.scheduler.snapshots().await;
    csv_response(export::attempts_csv_string(&runs))
}

async fn export_samples(State(state): State<AppState>) -> Response {
    let runs = state.scheduler.snapshots().await;
    csv_response(export::samples_csv_string(&runs))
}

// ============================================================================
// Notification and Metrics Handlers
// ============================================================================

async fn test_notification(
    State(state): State<AppState>,
    Json(request): Json<TestNotificationRequest>,
) -> Response {
    let Some(notifier) = state.notifier.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "No notifier configured");
    };

    let message = request
        .message
        .unwrap_or_else(|| "slotrush test notification".to_string());
    match notifier.send(&message).await {
        Ok(status) if status.success => Json(ApiResponse::success(status)).into_response(),
        Ok(status) => error_response(StatusCode::BAD_GATEWAY, status.to_string()),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn get_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}
