//! Read-only status reference data.

use axum::extract::{Path, State};
use axum::response::Response;

use crate::error::DomainError;
use crate::http::error::ApiError;
use crate::http::types::ok;
use crate::http::AppState;

pub async fn list_statuses(State(state): State<AppState>) -> Result<Response, ApiError> {
    let statuses = state.db.list_statuses().await?;
    Ok(ok("statuses", statuses))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(status_id): Path<i32>,
) -> Result<Response, ApiError> {
    let Some(status) = state.db.get_status(status_id).await? else {
        return Err(ApiError::domain(DomainError::StatusNotFound));
    };
    Ok(ok("status", status))
}
