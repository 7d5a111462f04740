//! Error types for every layer of the backend.
//!
//! `DomainError` variants carry the stable short strings that clients match
//! on; they are surfaced verbatim in the HTTP error envelope. Infrastructure
//! errors (`DatabaseError`, `SsoError`) never leak their detail to clients.

use thiserror::Error;

/// Configuration loading and validation failures. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key {key}")]
    MissingKey { key: &'static str },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("failed to read config file {path}: {message}")]
    File { path: String, message: String },
}

/// Persistence-layer failures.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("pool error: {0}")]
    Pool(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

/// SSO RPC failures, split so the handler layer can map credential problems
/// to 401/409 while transport problems stay 500.
#[derive(Debug, Error)]
pub enum SsoError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user already exists")]
    UserAlreadyExists,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("sso transport error: {0}")]
    Transport(String),

    #[error("sso returned malformed response: {0}")]
    Malformed(String),
}

/// Token-verification failures in the auth gateway.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing_auth_token")]
    MissingToken,

    #[error("invalid_auth_token")]
    InvalidToken,

    #[error("jwks unavailable: {0}")]
    JwksUnavailable(String),
}

/// HTTP server lifecycle failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Domain errors with client-stable identifiers.
///
/// `Display` output is the wire string; never reword a variant without a
/// coordinated client change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DomainError {
    // Validation
    #[error("empty_request_body")]
    EmptyRequestBody,
    #[error("invalid_json")]
    InvalidJson,
    #[error("empty_request_data")]
    EmptyRequestData,
    #[error("invalid_request_data")]
    InvalidRequestData,
    #[error("invalid_cursor")]
    InvalidCursor,
    #[error("invalid_task_time_range")]
    InvalidTaskTimeRange,

    // Entity presence
    #[error("user_not_found")]
    UserNotFound,
    #[error("list_not_found")]
    ListNotFound,
    #[error("default_list_not_found")]
    DefaultListNotFound,
    #[error("heading_not_found")]
    HeadingNotFound,
    #[error("default_heading_not_found")]
    DefaultHeadingNotFound,
    #[error("task_not_found")]
    TaskNotFound,
    #[error("status_not_found")]
    StatusNotFound,
    #[error("tag_not_found")]
    TagNotFound,
    #[error("no_lists_found")]
    NoListsFound,
    #[error("no_headings_found")]
    NoHeadingsFound,
    #[error("no_tasks_found")]
    NoTasksFound,
    #[error("no_tags_found")]
    NoTagsFound,
    #[error("session_not_found")]
    SessionNotFound,

    // Conflicts
    #[error("user_already_exists")]
    UserAlreadyExists,
    #[error("email_already_taken")]
    EmailAlreadyTaken,
    #[error("no_changes_detected")]
    NoChangesDetected,
    #[error("cannot_delete_default_list")]
    CannotDeleteDefaultList,
}
