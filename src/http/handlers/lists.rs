//! List handlers, including task creation routed through a list.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::{Extension, Json};

use crate::db::{CreateTaskParams, DeleteListOutcome};
use crate::error::DomainError;
use crate::http::error::{json_rejection, ApiError};
use crate::http::middleware::AuthUser;
use crate::http::types::{created, ok, CreateTaskRequest, TaskIdResponse, TitlePayload, ViewQuery};
use crate::http::AppState;
use crate::pagination::effective_limit;

pub async fn list_lists(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Response, ApiError> {
    let lists = state.db.list_lists(&user_id).await?;
    if lists.is_empty() {
        return Err(ApiError::domain(DomainError::NoListsFound));
    }
    Ok(ok("lists", lists))
}

pub async fn create_list(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Result<Json<TitlePayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let title = super::require_title(&req.title)?;
    let list = state.db.create_list(&user_id, title).await?;
    Ok(created("list created", list))
}

pub async fn get_default_list(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Response, ApiError> {
    let Some(list) = state.db.get_default_list(&user_id).await? else {
        return Err(ApiError::domain(DomainError::DefaultListNotFound));
    };
    Ok(ok("default list", list))
}

/// `POST /user/lists/default` — create a task in the default list's
/// default heading.
pub async fn create_task_in_default(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    create_task(state, user_id, body, None, None).await
}

pub async fn get_list(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(list_id): Path<String>,
) -> Result<Response, ApiError> {
    let Some(list) = state.db.get_list(&user_id, &list_id).await? else {
        return Err(ApiError::domain(DomainError::ListNotFound));
    };
    Ok(ok("list", list))
}

pub async fn update_list(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(list_id): Path<String>,
    body: Result<Json<TitlePayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let title = super::require_title(&req.title)?;
    let Some(list) = state.db.update_list(&user_id, &list_id, title).await? else {
        return Err(ApiError::domain(DomainError::ListNotFound));
    };
    Ok(ok("list updated", list))
}

pub async fn delete_list(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(list_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.db.delete_list(&user_id, &list_id).await? {
        DeleteListOutcome::Deleted => Ok(ok("list deleted", ())),
        DeleteListOutcome::NotFound => Err(ApiError::domain(DomainError::ListNotFound)),
        DeleteListOutcome::Default => {
            Err(ApiError::domain(DomainError::CannotDeleteDefaultList))
        }
    }
}

pub async fn tasks_by_list(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(list_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    if state.db.get_list(&user_id, &list_id).await?.is_none() {
        return Err(ApiError::domain(DomainError::ListNotFound));
    }
    let tasks = state
        .db
        .tasks_by_list(&user_id, &list_id, effective_limit(query.limit))
        .await?;
    if tasks.is_empty() {
        return Err(ApiError::domain(DomainError::NoTasksFound));
    }
    Ok(ok("tasks", tasks))
}

pub async fn create_task_in_list(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(list_id): Path<String>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    create_task(state, user_id, body, Some(list_id), None).await
}

/// Shared create path for the default/list/heading placements.
pub(super) async fn create_task(
    state: AppState,
    user_id: String,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
    list_id: Option<String>,
    heading_id: Option<String>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let title = super::require_title(&req.title)?;

    let start = req.start_time.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let end = req.end_time.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let (start_time, end_time) = match (start, end) {
        (None, None) => (None, None),
        (Some(s), Some(e)) => (Some(super::parse_time(s)?), Some(super::parse_time(e)?)),
        _ => return Err(ApiError::domain(DomainError::InvalidTaskTimeRange)),
    };

    let params = CreateTaskParams {
        title: title.to_string(),
        description: req.description.unwrap_or_default(),
        start_date: req.start_date,
        deadline: req.deadline,
        start_time,
        end_time,
        list_id,
        heading_id,
        tags: req.tags.unwrap_or_default(),
    };

    let task = super::task_outcome(state.db.create_task(&user_id, &params).await?)?;
    Ok(created("task created", TaskIdResponse { task_id: task.id }))
}
