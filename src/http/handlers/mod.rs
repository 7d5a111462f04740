//! Route handlers, grouped by resource.

pub mod auth;
pub mod headings;
pub mod lists;
pub mod statuses;
pub mod tags;
pub mod tasks;
pub mod user;
pub mod views;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};

use crate::db::TaskWriteOutcome;
use crate::error::DomainError;
use crate::http::error::ApiError;
use crate::http::types::{Envelope, HealthData};
use crate::http::AppState;

/// `GET /health` — liveness plus a DB reachability probe.
pub async fn health(State(state): State<AppState>) -> Response {
    let uptime_secs = state.startup_time.elapsed().as_secs();
    match state.db.ping().await {
        Ok(()) => crate::http::types::ok(
            "healthy",
            HealthData {
                status: "ok",
                database: "ok",
                uptime_secs,
            },
        ),
        Err(err) => {
            tracing::error!(error = %err, "health check failed");
            let status = StatusCode::SERVICE_UNAVAILABLE;
            (
                status,
                Json(Envelope {
                    code: status.as_u16(),
                    status_text: status.canonical_reason().unwrap_or_default().to_string(),
                    description: "degraded".to_string(),
                    data: HealthData {
                        status: "degraded",
                        database: "unreachable",
                        uptime_secs,
                    },
                }),
            )
                .into_response()
        }
    }
}

/// Reject blank titles before they reach the store.
pub(crate) fn require_title(raw: &str) -> Result<&str, ApiError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ApiError::domain(DomainError::EmptyRequestData));
    }
    Ok(title)
}

pub(crate) fn require_email(raw: &str) -> Result<String, ApiError> {
    let email = raw.trim();
    if email.is_empty() {
        return Err(ApiError::domain(DomainError::EmptyRequestData));
    }
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(ApiError::domain(DomainError::InvalidRequestData));
    }
    Ok(email.to_string())
}

/// Accept RFC 3339 or the `YYYY-MM-DD HH:MM:SS` form clients send.
pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    Err(ApiError::domain(DomainError::InvalidRequestData))
}

/// Collapse a task-write outcome into the record or the precise
/// presence error.
pub(crate) fn task_outcome(
    outcome: TaskWriteOutcome,
) -> Result<crate::db::TaskRecord, ApiError> {
    match outcome {
        TaskWriteOutcome::Done(task) => Ok(task),
        TaskWriteOutcome::TaskNotFound => Err(ApiError::domain(DomainError::TaskNotFound)),
        TaskWriteOutcome::ListNotFound => Err(ApiError::domain(DomainError::ListNotFound)),
        TaskWriteOutcome::HeadingNotFound => {
            Err(ApiError::domain(DomainError::HeadingNotFound))
        }
        TaskWriteOutcome::DefaultListNotFound => {
            Err(ApiError::domain(DomainError::DefaultListNotFound))
        }
        TaskWriteOutcome::DefaultHeadingNotFound => {
            Err(ApiError::domain(DomainError::DefaultHeadingNotFound))
        }
    }
}
