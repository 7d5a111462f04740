//! Task handlers: the flat per-user listing, reads, dynamic partial
//! updates, time-range updates, moves, and lifecycle transitions.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::{Extension, Json};

use crate::db::{TaskStatus, UpdateTaskParams};
use crate::error::DomainError;
use crate::http::error::{json_rejection, ApiError};
use crate::http::middleware::AuthUser;
use crate::http::types::{
    ok, MoveTaskToHeadingQuery, MoveTaskToListQuery, TaskTimeRequest, UpdateTaskRequest,
    ViewQuery,
};
use crate::http::AppState;
use crate::pagination::{effective_limit, parse_cursor, Cursor};

pub async fn tasks_by_user(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    let after_id = match parse_cursor(query.cursor_raw())? {
        Cursor::Unset => None,
        Cursor::Id(id) => Some(id),
        Cursor::Date(_) => return Err(ApiError::domain(DomainError::InvalidCursor)),
    };
    let tasks = state
        .db
        .tasks_by_user(&user_id, after_id.as_deref(), effective_limit(query.limit))
        .await?;
    if tasks.is_empty() {
        return Err(ApiError::domain(DomainError::NoTasksFound));
    }
    Ok(ok("tasks", tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(task) = state.db.get_task(&user_id, &task_id).await? else {
        return Err(ApiError::domain(DomainError::TaskNotFound));
    };
    Ok(ok("task", task))
}

pub async fn update_task(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
    body: Result<Json<UpdateTaskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;

    let status = match req.status_id {
        None => None,
        Some(id) => Some(
            TaskStatus::from_id(id).ok_or_else(|| ApiError::domain(DomainError::StatusNotFound))?,
        ),
    };
    if let Some(title) = &req.title {
        super::require_title(title)?;
    }

    let params = UpdateTaskParams {
        title: req.title.map(|t| t.trim().to_string()),
        description: req.description,
        start_date: req.start_date,
        deadline: req.deadline,
        status,
        tags: req.tags,
    };
    if params.is_empty() {
        return Err(ApiError::domain(DomainError::NoChangesDetected));
    }

    let task = super::task_outcome(state.db.update_task(&user_id, &task_id, &params).await?)?;
    Ok(ok("task updated", task))
}

/// `PATCH /user/tasks/{task_id}/time` — both ends present sets the range,
/// both empty clears it, anything else is a 400.
pub async fn update_time(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
    body: Result<Json<TaskTimeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;

    let start = req.start_time.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let end = req.end_time.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let range = match (start, end) {
        (None, None) => None,
        (Some(s), Some(e)) => Some((super::parse_time(s)?, super::parse_time(e)?)),
        _ => return Err(ApiError::domain(DomainError::InvalidTaskTimeRange)),
    };

    let Some(task) = state.db.update_task_time(&user_id, &task_id, range).await? else {
        return Err(ApiError::domain(DomainError::TaskNotFound));
    };
    Ok(ok("task time updated", task))
}

pub async fn move_to_list(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
    Query(query): Query<MoveTaskToListQuery>,
) -> Result<Response, ApiError> {
    let task = super::task_outcome(
        state
            .db
            .move_task_to_list(&user_id, &task_id, &query.list_id)
            .await?,
    )?;
    Ok(ok("task moved", task))
}

pub async fn move_to_heading(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
    Query(query): Query<MoveTaskToHeadingQuery>,
) -> Result<Response, ApiError> {
    let task = super::task_outcome(
        state
            .db
            .move_task_to_heading(&user_id, &task_id, &query.heading_id)
            .await?,
    )?;
    Ok(ok("task moved", task))
}

/// Idempotent: completing a completed task succeeds again.
pub async fn complete(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(task) = state.db.complete_task(&user_id, &task_id).await? else {
        return Err(ApiError::domain(DomainError::TaskNotFound));
    };
    Ok(ok("task completed", task))
}

pub async fn archive(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(task) = state.db.archive_task(&user_id, &task_id).await? else {
        return Err(ApiError::domain(DomainError::TaskNotFound));
    };
    Ok(ok("task archived", task))
}
