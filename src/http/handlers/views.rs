//! The grouped scheduling views: today, upcoming, overdue, someday,
//! completed, archived.

use axum::extract::{Query, State};
use axum::response::Response;
use axum::Extension;
use chrono::{NaiveDate, Utc};

use crate::error::DomainError;
use crate::http::error::ApiError;
use crate::http::middleware::AuthUser;
use crate::http::types::{ok, ViewQuery};
use crate::http::AppState;
use crate::pagination::{effective_limit, parse_cursor, Cursor};
use crate::views::decode_groups;

fn id_cursor(query: &ViewQuery) -> Result<Option<String>, ApiError> {
    match parse_cursor(query.cursor_raw())? {
        Cursor::Unset => Ok(None),
        Cursor::Id(id) => Ok(Some(id)),
        Cursor::Date(_) => Err(ApiError::domain(DomainError::InvalidCursor)),
    }
}

fn date_cursor(query: &ViewQuery) -> Result<Option<NaiveDate>, ApiError> {
    match parse_cursor(query.cursor_raw())? {
        Cursor::Unset => Ok(None),
        Cursor::Date(date) => Ok(Some(date)),
        Cursor::Id(_) => Err(ApiError::domain(DomainError::InvalidCursor)),
    }
}

pub async fn today(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    let raw = state
        .db
        .today_groups(&user_id, effective_limit(query.limit))
        .await?;
    let groups = decode_groups(raw)?;
    if groups.is_empty() {
        return Err(ApiError::domain(DomainError::NoTasksFound));
    }
    Ok(ok("today", groups))
}

pub async fn upcoming(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    // Empty cursor means "from today", i.e. groups from tomorrow onward.
    let after = date_cursor(&query)?.unwrap_or_else(|| Utc::now().date_naive());
    let raw = state
        .db
        .upcoming_groups(&user_id, after, effective_limit(query.limit))
        .await?;
    let groups = decode_groups(raw)?;
    if groups.is_empty() {
        return Err(ApiError::domain(DomainError::NoTasksFound));
    }
    Ok(ok("upcoming", groups))
}

pub async fn overdue(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    let after_list_id = id_cursor(&query)?;
    let raw = state
        .db
        .overdue_groups(
            &user_id,
            after_list_id.as_deref(),
            effective_limit(query.limit),
        )
        .await?;
    let groups = decode_groups(raw)?;
    if groups.is_empty() {
        return Err(ApiError::domain(DomainError::NoTasksFound));
    }
    Ok(ok("overdue", groups))
}

pub async fn someday(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    let after_list_id = id_cursor(&query)?;
    let raw = state
        .db
        .someday_groups(
            &user_id,
            after_list_id.as_deref(),
            effective_limit(query.limit),
        )
        .await?;
    let groups = decode_groups(raw)?;
    if groups.is_empty() {
        return Err(ApiError::domain(DomainError::NoTasksFound));
    }
    Ok(ok("someday", groups))
}

pub async fn completed(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    let after = date_cursor(&query)?;
    let raw = state
        .db
        .completed_groups(&user_id, after, effective_limit(query.limit))
        .await?;
    let groups = decode_groups(raw)?;
    if groups.is_empty() {
        return Err(ApiError::domain(DomainError::NoTasksFound));
    }
    Ok(ok("completed", groups))
}

pub async fn archived(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ApiError> {
    let before = date_cursor(&query)?;
    let raw = state
        .db
        .archived_groups(&user_id, before, effective_limit(query.limit))
        .await?;
    let groups = decode_groups(raw)?;
    if groups.is_empty() {
        return Err(ApiError::domain(DomainError::NoTasksFound));
    }
    Ok(ok("archived", groups))
}
