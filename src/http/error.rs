//! HTTP error envelope and the domain-error → status-code mapping.
//!
//! Domain errors surface their stable string verbatim; infrastructure
//! errors are logged with full detail and surface as an opaque 500.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AuthError, DatabaseError, DomainError, SsoError};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub status_code: u16,
    pub location: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    #[track_caller]
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        let caller = std::panic::Location::caller();
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                status_code: status.as_u16(),
                location: format!("{}:{}", caller.file(), caller.line()),
                time: Utc::now(),
            },
        }
    }

    #[track_caller]
    pub fn domain(err: DomainError) -> Self {
        Self::new(domain_status(err), err.to_string())
    }

    pub fn error_text(&self) -> &str {
        &self.body.error
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

pub fn domain_status(err: DomainError) -> StatusCode {
    use DomainError::*;
    match err {
        EmptyRequestBody | InvalidJson | EmptyRequestData | InvalidRequestData
        | InvalidCursor | InvalidTaskTimeRange | NoChangesDetected
        | CannotDeleteDefaultList => StatusCode::BAD_REQUEST,

        UserNotFound | ListNotFound | DefaultListNotFound | HeadingNotFound
        | DefaultHeadingNotFound | TaskNotFound | StatusNotFound | TagNotFound
        | NoListsFound | NoHeadingsFound | NoTasksFound | NoTagsFound
        | SessionNotFound => StatusCode::NOT_FOUND,

        UserAlreadyExists | EmailAlreadyTaken => StatusCode::CONFLICT,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self::domain(err)
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        tracing::error!(error = %err, "database failure");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => {
                Self::new(StatusCode::UNAUTHORIZED, "missing_auth_token")
            }
            AuthError::InvalidToken => {
                Self::new(StatusCode::UNAUTHORIZED, "invalid_auth_token")
            }
            AuthError::JwksUnavailable(detail) => {
                tracing::error!(error = %detail, "jwks unavailable");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl From<SsoError> for ApiError {
    fn from(err: SsoError) -> Self {
        match err {
            SsoError::InvalidCredentials => {
                Self::new(StatusCode::UNAUTHORIZED, "invalid_credentials")
            }
            SsoError::UserAlreadyExists => Self::domain(DomainError::UserAlreadyExists),
            SsoError::InvalidToken => Self::new(StatusCode::UNAUTHORIZED, "invalid_auth_token"),
            SsoError::Transport(detail) | SsoError::Malformed(detail) => {
                tracing::error!(error = %detail, "sso failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

/// Map body-extractor rejections onto the validation taxonomy.
pub fn json_rejection(rejection: JsonRejection) -> ApiError {
    let err = match rejection {
        JsonRejection::JsonSyntaxError(_) => DomainError::InvalidJson,
        JsonRejection::JsonDataError(_) => DomainError::InvalidRequestData,
        JsonRejection::MissingJsonContentType(_) | JsonRejection::BytesRejection(_) => {
            DomainError::EmptyRequestBody
        }
        _ => DomainError::InvalidJson,
    };
    ApiError::domain(err)
}
