//! Authentication flow: registration bootstrap, login, token refresh,
//! logout, and the pass-through credential operations the SSO owns.

use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::Response;
use axum::{Form, Json};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;

use crate::config::JwtConfig;
use crate::db::{BootstrapOutcome, SessionRecord};
use crate::error::DomainError;
use crate::http::error::{json_rejection, ApiError};
use crate::http::middleware::{cookie_value, AuthUser, REFRESH_COOKIE, REFRESH_HEADER};
use crate::http::types::{
    created, ok, ChangePasswordRequest, LoginRequest, RefreshForm, RegisterRequest,
    ResetPasswordQuery, TokenResponse, VerifyEmailRequest,
};
use crate::http::AppState;
use crate::sso::TokenData;

const DEFAULT_APP_ID: i32 = 1;
const MIN_PASSWORD_LEN: usize = 8;

pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let email = super::require_email(&req.email)?;
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::domain(DomainError::InvalidRequestData));
    }

    let auth = state
        .sso
        .register(&email, &req.password, req.app_id.unwrap_or(DEFAULT_APP_ID))
        .await?;

    match state.db.bootstrap_user(&auth.user_id, &email).await? {
        BootstrapOutcome::AlreadyExists => {
            return Err(ApiError::domain(DomainError::UserAlreadyExists));
        }
        BootstrapOutcome::Created | BootstrapOutcome::Resurrected => {}
    }

    let expires_at = persist_session(&state, &auth.user_id, &headers, addr, &auth.token).await?;

    let response = created(
        "user registered",
        TokenResponse {
            access_token: auth.token.access_token.clone(),
            refresh_token: auth.token.refresh_token.clone(),
        },
    );
    Ok(with_cookie(
        response,
        refresh_cookie(&state.config.jwt, &auth.token.refresh_token, expires_at),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let email = super::require_email(&req.email)?;

    let auth = state
        .sso
        .login(&email, &req.password, req.app_id.unwrap_or(DEFAULT_APP_ID))
        .await?;

    // A soft-deleted account stays deleted until it re-registers.
    if state.db.get_user(&auth.user_id).await?.is_none() {
        return Err(ApiError::domain(DomainError::UserNotFound));
    }

    let expires_at = persist_session(&state, &auth.user_id, &headers, addr, &auth.token).await?;

    let response = ok(
        "logged in",
        TokenResponse {
            access_token: auth.token.access_token.clone(),
            refresh_token: auth.token.refresh_token.clone(),
        },
    );
    Ok(with_cookie(
        response,
        refresh_cookie(&state.config.jwt, &auth.token.refresh_token, expires_at),
    ))
}

pub async fn refresh_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<RefreshForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let token = cookie_value(&headers, REFRESH_COOKIE)
        .or_else(|| {
            headers
                .get(REFRESH_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .or_else(|| {
            form.ok()
                .map(|Form(f)| f.refresh_token)
                .filter(|t| !t.trim().is_empty())
        })
        .ok_or_else(|| ApiError::new(axum::http::StatusCode::UNAUTHORIZED, "missing_auth_token"))?;

    let Some(session) = state.db.get_session_by_refresh_token(&token).await? else {
        return Err(ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            "invalid_auth_token",
        ));
    };
    if session.expires_at <= Utc::now() {
        return Err(ApiError::new(
            axum::http::StatusCode::UNAUTHORIZED,
            "invalid_auth_token",
        ));
    }

    let fresh = state.sso.refresh(&token).await?;
    let expires_at = Utc::now() + state.config.jwt.refresh_token_ttl;
    state
        .db
        .save_session(&SessionRecord {
            user_id: session.user_id,
            device_id: session.device_id,
            refresh_token: fresh.refresh_token.clone(),
            last_visit_at: Utc::now(),
            expires_at,
        })
        .await?;

    let response = ok(
        "tokens refreshed",
        TokenResponse {
            access_token: fresh.access_token.clone(),
            refresh_token: fresh.refresh_token.clone(),
        },
    );
    Ok(with_cookie(
        response,
        refresh_cookie(&state.config.jwt, &fresh.refresh_token, expires_at),
    ))
}

pub async fn logout(
    State(state): State<AppState>,
    axum::Extension(AuthUser(user_id)): axum::Extension<AuthUser>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let refresh_token = cookie_value(&headers, REFRESH_COOKIE).or_else(|| {
        headers
            .get(REFRESH_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    });

    if let Some(token) = refresh_token {
        if let Some(session) = state.db.get_session_by_refresh_token(&token).await? {
            if session.user_id == user_id {
                state
                    .db
                    .delete_session(&session.user_id, &session.device_id)
                    .await?;
            }
        }
        if let Err(err) = state.sso.logout(&token).await {
            tracing::warn!(error = %err, "sso logout failed");
        }
    }

    let response = ok("logged out", ());
    Ok(with_cookie(response, expired_refresh_cookie(&state.config.jwt)))
}

pub async fn verify_email(
    State(state): State<AppState>,
    body: Result<Json<VerifyEmailRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    if req.token.trim().is_empty() {
        return Err(ApiError::domain(DomainError::EmptyRequestData));
    }
    state.sso.verify_email(req.token.trim()).await?;
    Ok(ok("email verified", ()))
}

pub async fn reset_password(
    State(state): State<AppState>,
    Query(query): Query<ResetPasswordQuery>,
) -> Result<Response, ApiError> {
    let email = super::require_email(&query.email)?;
    state.sso.reset_password(&email).await?;
    Ok(ok("password reset initiated", ()))
}

pub async fn change_password(
    State(state): State<AppState>,
    body: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(json_rejection)?;
    let email = super::require_email(&req.email)?;
    if req.new_password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::domain(DomainError::InvalidRequestData));
    }
    state
        .sso
        .change_password(&email, &req.current_password, &req.new_password)
        .await?;
    Ok(ok("password changed", ()))
}

/// Register the device and upsert its single session; returns the session
/// expiry used for the cookie.
async fn persist_session(
    state: &AppState,
    user_id: &str,
    headers: &HeaderMap,
    addr: SocketAddr,
    token: &TokenData,
) -> Result<DateTime<Utc>, ApiError> {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let device_id = state
        .db
        .register_device(user_id, user_agent, &addr.ip().to_string())
        .await?;

    let expires_at = Utc::now() + state.config.jwt.refresh_token_ttl;
    state
        .db
        .save_session(&SessionRecord {
            user_id: user_id.to_string(),
            device_id,
            refresh_token: token.refresh_token.clone(),
            last_visit_at: Utc::now(),
            expires_at,
        })
        .await?;
    Ok(expires_at)
}

fn with_cookie(mut response: Response, cookie: HeaderValue) -> Response {
    response.headers_mut().append(header::SET_COOKIE, cookie);
    response
}

fn refresh_cookie(config: &JwtConfig, value: &str, expires: DateTime<Utc>) -> HeaderValue {
    let mut cookie = format!(
        "{REFRESH_COOKIE}={value}; Path={}; HttpOnly; Expires={}",
        config.refresh_token_cookie_path,
        expires.format("%a, %d %b %Y %H:%M:%S GMT"),
    );
    if !config.refresh_token_cookie_domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(&config.refresh_token_cookie_domain);
    }
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Logout cookie: empty value, epoch expiry, negative max-age.
fn expired_refresh_cookie(config: &JwtConfig) -> HeaderValue {
    let mut cookie = format!(
        "{REFRESH_COOKIE}=; Path={}; HttpOnly; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=-1",
        config.refresh_token_cookie_path,
    );
    if !config.refresh_token_cookie_domain.is_empty() {
        cookie.push_str("; Domain=");
        cookie.push_str(&config.refresh_token_cookie_domain);
    }
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}
