//! Account handlers: profile read, email update, full purge.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::{Extension, Json};

use crate::db::EmailUpdateOutcome;
use crate::error::DomainError;
use crate::http::error::{json_rejection, ApiError};
use crate::http::middleware::AuthUser;
use crate::http::types::{ok, UpdateUserRequest};
use crate::http::AppState;

pub async fn get_user(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Response, ApiError> {
    let Some(user) = state.db.get_user(&user_id).await? else {
        return Err(ApiError::domain(DomainError::UserNotFound));
    };
    Ok(ok("user", user))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    body: Result<Json<UpdateUserRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let Some(email) = req.email else {
        return Err(ApiError::domain(DomainError::NoChangesDetected));
    };
    let email = super::require_email(&email)?;

    match state.db.update_user_email(&user_id, &email).await? {
        EmailUpdateOutcome::Updated(user) => Ok(ok("user updated", user)),
        EmailUpdateOutcome::NotFound => Err(ApiError::domain(DomainError::UserNotFound)),
        EmailUpdateOutcome::Taken => Err(ApiError::domain(DomainError::EmailAlreadyTaken)),
    }
}

/// Soft-deletes the user and everything they own, in one transaction on
/// the database side.
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Response, ApiError> {
    if !state.db.delete_user_related_data(&user_id).await? {
        return Err(ApiError::domain(DomainError::UserNotFound));
    }
    Ok(ok("user deleted", ()))
}
