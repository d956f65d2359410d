//! HTTP request handlers.

use super::AppState;
use crate::db::{CheckResult, CurrentStatus, DailyUptime, DbError, Incident, Monitor, MonitorStats, PendingOutage};
use crate::scheduler::SchedulerError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

pub const DEFAULT_STATS_WINDOW_SECS: i64 = 24 * 3600;
pub const DEFAULT_INCIDENT_LIMIT: i64 = 50;
const MAX_INCIDENT_LIMIT: i64 = 500;
pub const DEFAULT_CHECK_LIMIT: i64 = 100;
const MAX_CHECK_LIMIT: i64 = 1000;

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_monitors: usize,
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        active_monitors: state.scheduler.active_count(),
    })
}

// ============================================================================
// Control: start / stop / restart
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "monitorId")]
    pub monitor_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub status: &'static str,
    pub message: String,
}

impl ControlResponse {
    fn success(message: String) -> Response {
        Json(Self {
            status: "success",
            message,
        })
        .into_response()
    }

    fn error(code: StatusCode, message: String) -> Response {
        (code, Json(Self { status: "error", message })).into_response()
    }
}

pub async fn handle_start(State(state): State<AppState>, Json(req): Json<ControlRequest>) -> Response {
    let id = req.monitor_id;
    let scheduler = state.scheduler.clone();
    let result = run_control(&state, async move { scheduler.start(id).await }).await;
    control_response(id, "started", result)
}

pub async fn handle_stop(State(state): State<AppState>, Json(req): Json<ControlRequest>) -> Response {
    let id = req.monitor_id;
    let scheduler = state.scheduler.clone();
    let result = run_control(&state, async move {
        scheduler.stop(id).await;
        Ok(())
    })
    .await;
    control_response(id, "stopped", result)
}

pub async fn handle_restart(State(state): State<AppState>, Json(req): Json<ControlRequest>) -> Response {
    let id = req.monitor_id;
    let scheduler = state.scheduler.clone();
    let result = run_control(&state, async move { scheduler.restart(id).await }).await;
    control_response(id, "restarted", result)
}

enum ControlFailure {
    Scheduler(SchedulerError),
    TimedOut,
    Aborted(String),
}

/// Run a control operation on its own task, bounded by the control timeout.
///
/// A timed-out operation keeps running to completion so the scheduler is
/// never left half-way through a start or restart.
async fn run_control(
    state: &AppState,
    op: impl Future<Output = Result<(), SchedulerError>> + Send + 'static,
) -> Result<(), ControlFailure> {
    let handle = tokio::spawn(op);
    match tokio::time::timeout(state.config.control_timeout, handle).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(ControlFailure::Scheduler(e)),
        Ok(Err(e)) => Err(ControlFailure::Aborted(e.to_string())),
        Err(_) => Err(ControlFailure::TimedOut),
    }
}

fn control_response(id: i64, verb: &str, result: Result<(), ControlFailure>) -> Response {
    match result {
        Ok(()) => ControlResponse::success(format!("Monitor {} {}", id, verb)),
        Err(ControlFailure::Scheduler(e)) => {
            let code = match &e {
                SchedulerError::MonitorNotFound(_) => StatusCode::NOT_FOUND,
                SchedulerError::InvalidMonitor { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            ControlResponse::error(code, e.to_string())
        }
        Err(ControlFailure::TimedOut) => {
            tracing::warn!(monitor_id = id, "Control request timed out");
            ControlResponse::error(
                StatusCode::GATEWAY_TIMEOUT,
                format!("Monitor {} was not {} in time", id, verb),
            )
        }
        Err(ControlFailure::Aborted(e)) => ControlResponse::error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

// ============================================================================
// Reads
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MonitorSummary {
    #[serde(flatten)]
    pub monitor: Monitor,
    pub running: bool,
}

pub async fn handle_list_monitors(State(state): State<AppState>) -> Response {
    match state.store.get_monitors() {
        Ok(monitors) => {
            let summaries: Vec<MonitorSummary> = monitors
                .into_iter()
                .map(|monitor| MonitorSummary {
                    running: state.scheduler.is_running(monitor.id),
                    monitor,
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusResponse {
    Success {
        data: CurrentStatus,
        running: bool,
        pending_outage: Option<PendingOutage>,
        open_incident: Option<Incident>,
    },
    Unknown,
}

pub async fn handle_status(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match status_for(&state, id) {
        Ok(response) => Json(response).into_response(),
        Err(e) => db_error_response(e),
    }
}

fn status_for(state: &AppState, id: i64) -> Result<StatusResponse, DbError> {
    let Some(data) = state.store.get_current_status(id)? else {
        return Ok(StatusResponse::Unknown);
    };
    Ok(StatusResponse::Success {
        data,
        running: state.scheduler.is_running(id),
        pending_outage: state.store.get_pending_outage(id)?,
        open_incident: state.store.get_open_incident(id)?,
    })
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub window_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub monitor_id: i64,
    pub window_secs: i64,
    #[serde(flatten)]
    pub stats: MonitorStats,
}

pub async fn handle_stats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let window_secs = query.window_secs.unwrap_or(DEFAULT_STATS_WINDOW_SECS);
    let since = match stats_window_start(window_secs) {
        Some(since) => since,
        None => {
            return (StatusCode::BAD_REQUEST, "window_secs must be positive and in range").into_response()
        }
    };

    if let Err(e) = state.store.get_monitor(id) {
        return db_error_response(e);
    }

    match state.store.get_stats(id, since) {
        Ok(stats) => Json(StatsResponse {
            monitor_id: id,
            window_secs,
            stats,
        })
        .into_response(),
        Err(e) => db_error_response(e),
    }
}

/// Start of a stats window ending now, or `None` if the window is not
/// positive or reaches outside the representable time range.
fn stats_window_start(window_secs: i64) -> Option<DateTime<Utc>> {
    if window_secs <= 0 {
        return None;
    }
    ChronoDuration::try_seconds(window_secs).and_then(|window| Utc::now().checked_sub_signed(window))
}

#[derive(Debug, Deserialize)]
pub struct IncidentsQuery {
    pub limit: Option<i64>,
}

pub async fn handle_incidents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<IncidentsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_INCIDENT_LIMIT)
        .clamp(1, MAX_INCIDENT_LIMIT);

    if let Err(e) = state.store.get_monitor(id) {
        return db_error_response(e);
    }

    match state.store.get_incidents(id, limit) {
        Ok(incidents) => Json::<Vec<Incident>>(incidents).into_response(),
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChecksQuery {
    pub limit: Option<i64>,
}

/// Most recent logged checks, oldest first.
pub async fn handle_checks(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ChecksQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_CHECK_LIMIT).clamp(1, MAX_CHECK_LIMIT);

    if let Err(e) = state.store.get_monitor(id) {
        return db_error_response(e);
    }

    match state.store.get_check_log(id, limit) {
        Ok(checks) => Json::<Vec<CheckResult>>(checks).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_daily_uptime(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if let Err(e) = state.store.get_monitor(id) {
        return db_error_response(e);
    }

    match state.store.get_daily_uptime(id) {
        Ok(days) => Json::<Vec<DailyUptime>>(days).into_response(),
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// Delete
// ============================================================================

pub async fn handle_delete_monitor(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    state.scheduler.stop(id).await;

    match state.store.delete_monitor(id) {
        Ok(()) => {
            state.scheduler.forget(id);
            tracing::info!(monitor_id = id, "Deleted monitor");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error_response(e),
    }
}

fn db_error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Monitor not found").into_response(),
        e => {
            tracing::error!("Store error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
