//! Request and response DTOs for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

/// Success envelope wrapping every non-error payload.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: u16,
    pub status_text: String,
    pub description: String,
    pub data: T,
}

pub fn ok<T: Serialize>(description: &str, data: T) -> Response {
    envelope(StatusCode::OK, description, data)
}

pub fn created<T: Serialize>(description: &str, data: T) -> Response {
    envelope(StatusCode::CREATED, description, data)
}

fn envelope<T: Serialize>(status: StatusCode, description: &str, data: T) -> Response {
    let body = Envelope {
        code: status.as_u16(),
        status_text: status
            .canonical_reason()
            .unwrap_or_default()
            .to_string(),
        description: description.to_string(),
        data,
    };
    (status, Json(body)).into_response()
}

/// Deserialize helper distinguishing an absent field from an explicit
/// `null`: absent stays `None`, `null` becomes `Some(None)`.
pub fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

// --- Auth ---

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub app_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub app_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordQuery {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub email: String,
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshForm {
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
}

// --- User ---

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
}

// --- Lists & headings ---

#[derive(Debug, Deserialize)]
pub struct TitlePayload {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveHeadingQuery {
    pub list_id: String,
}

// --- Tasks ---

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub deadline: Option<NaiveDate>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub start_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "double_option")]
    pub deadline: Option<Option<NaiveDate>>,
    pub status_id: Option<i32>,
    pub tags: Option<Vec<String>>,
}

/// Times arrive as strings so an empty string can mean "clear".
#[derive(Debug, Deserialize)]
pub struct TaskTimeRequest {
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MoveTaskToListQuery {
    pub list_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MoveTaskToHeadingQuery {
    pub heading_id: String,
}

#[derive(Debug, Serialize)]
pub struct TaskIdResponse {
    pub task_id: String,
}

// --- Views ---

#[derive(Debug, Default, Deserialize)]
pub struct ViewQuery {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
    /// Legacy alias for a date cursor, honored when `cursor` is absent.
    pub after_date: Option<String>,
}

impl ViewQuery {
    pub fn cursor_raw(&self) -> Option<&str> {
        self.cursor
            .as_deref()
            .or(self.after_date.as_deref())
    }
}

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthData {
    pub status: &'static str,
    pub database: &'static str,
    pub uptime_secs: u64,
}
