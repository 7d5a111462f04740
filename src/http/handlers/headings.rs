//! Heading handlers: CRUD inside a list, the grouped-by-heading view, and
//! the cross-list move with its task cascade.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::{Extension, Json};

use crate::error::DomainError;
use crate::http::error::{json_rejection, ApiError};
use crate::http::middleware::AuthUser;
use crate::http::types::{
    created, ok, CreateTaskRequest, MoveHeadingQuery, TitlePayload, ViewQuery,
};
use crate::http::AppState;
use crate::pagination::effective_limit;
use crate::views::decode_groups;

pub async fn create_heading(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(list_id): Path<String>,
    body: Result<Json<TitlePayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let title = super::require_title(&req.title)?;
    let Some(heading) = state.db.create_heading(&user_id, &list_id, title).await? else {
        return Err(ApiError::domain(DomainError::ListNotFound));
    };
    Ok(created("heading created", heading))
}

pub async fn list_headings(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(list_id): Path<String>,
) -> Result<Response, ApiError> {
    if state.db.get_list(&user_id, &list_id).await?.is_none() {
        return Err(ApiError::domain(DomainError::ListNotFound));
    }
    let headings = state.db.list_headings(&user_id, &list_id).await?;
    if headings.is_empty() {
        return Err(ApiError::domain(DomainError::NoHeadingsFound));
    }
    Ok(ok("headings", headings))
}

/// `GET /user/lists/{list_id}/headings/tasks` — every live heading of the
/// list as a group, empty ones included.
pub async fn heading_groups(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(list_id): Path<String>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    if state.db.get_list(&user_id, &list_id).await?.is_none() {
        return Err(ApiError::domain(DomainError::ListNotFound));
    }
    let raw = state
        .db
        .groups_by_heading(&user_id, &list_id, effective_limit(query.limit))
        .await?;
    let groups = decode_groups(raw)?;
    Ok(ok("tasks grouped by heading", groups))
}

pub async fn create_task_in_heading(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path((list_id, heading_id)): Path<(String, String)>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    // The heading must live in the addressed list.
    if state
        .db
        .get_heading(&user_id, &list_id, &heading_id)
        .await?
        .is_none()
    {
        return Err(ApiError::domain(DomainError::HeadingNotFound));
    }
    super::lists::create_task(state, user_id, body, None, Some(heading_id)).await
}

pub async fn get_heading(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path((list_id, heading_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let Some(heading) = state.db.get_heading(&user_id, &list_id, &heading_id).await? else {
        return Err(ApiError::domain(DomainError::HeadingNotFound));
    };
    Ok(ok("heading", heading))
}

pub async fn update_heading(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path((list_id, heading_id)): Path<(String, String)>,
    body: Result<Json<TitlePayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let title = super::require_title(&req.title)?;
    let Some(heading) = state
        .db
        .update_heading(&user_id, &list_id, &heading_id, title)
        .await?
    else {
        return Err(ApiError::domain(DomainError::HeadingNotFound));
    };
    Ok(ok("heading updated", heading))
}

pub async fn delete_heading(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path((list_id, heading_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if !state
        .db
        .delete_heading(&user_id, &list_id, &heading_id)
        .await?
    {
        return Err(ApiError::domain(DomainError::HeadingNotFound));
    }
    Ok(ok("heading deleted", ()))
}

/// `PATCH .../headings/{heading_id}/move?list_id=<new>` — re-points the
/// heading and all of its tasks in one transaction.
pub async fn move_heading(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path((list_id, heading_id)): Path<(String, String)>,
    Query(query): Query<MoveHeadingQuery>,
) -> Result<Response, ApiError> {
    if state
        .db
        .get_heading(&user_id, &list_id, &heading_id)
        .await?
        .is_none()
    {
        return Err(ApiError::domain(DomainError::HeadingNotFound));
    }
    if state.db.get_list(&user_id, &query.list_id).await?.is_none() {
        return Err(ApiError::domain(DomainError::ListNotFound));
    }
    if !state
        .db
        .move_heading(&user_id, &heading_id, &query.list_id)
        .await?
    {
        return Err(ApiError::domain(DomainError::HeadingNotFound));
    }
    Ok(ok("heading moved", ()))
}
