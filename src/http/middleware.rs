//! Request-pipeline middleware: request ids, URL-extension stripping,
//! per-IP rate limiting, and bearer-token authentication.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::Response;
use tower_http::request_id::{MakeRequestId, RequestId};
use ulid::Ulid;

use crate::error::AuthError;
use crate::http::error::ApiError;
use crate::http::AppState;

pub const JWT_COOKIE: &str = "jwtoken";
pub const JWT_QUERY: &str = "jwtoken";
pub const REFRESH_COOKIE: &str = "refreshToken";
pub const REFRESH_HEADER: &str = "RefreshToken";

/// Requests allowed per IP per minute.
pub const RATE_LIMIT_PER_MINUTE: u32 = 100;
const RATE_LIMIT_MAX_KEYS: usize = 4096;

/// The authenticated owner of the request, set by `authenticate`.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

/// ULID request ids, sortable like every other id in the system.
#[derive(Clone, Copy, Default)]
pub struct MakeRequestUlid;

impl MakeRequestId for MakeRequestUlid {
    fn make_request_id<B>(&mut self, _: &axum::http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Ulid::new().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Sliding-window rate limiter keyed by client IP. The key map is bounded
/// so an address scan cannot grow it without limit.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    pub fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let queue = inner.entry(key.to_string()).or_default();
        prune_queue(queue, now, self.window);
        if queue.len() >= limit as usize {
            return false;
        }
        queue.push_back(now);

        if inner.len() > RATE_LIMIT_MAX_KEYS {
            inner.retain(|_, events| {
                prune_queue(events, now, self.window);
                !events.is_empty()
            });
        }

        true
    }
}

fn prune_queue(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = queue.front() {
        if now.duration_since(*front) > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !state.rate_limiter.allow(&key, RATE_LIMIT_PER_MINUTE) {
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "too_many_requests",
        ));
    }
    Ok(next.run(request).await)
}

/// Clients may append `.json` to any path; the extension is advisory since
/// every response is JSON anyway.
pub async fn strip_url_extension(mut request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if let Some(stripped) = path.strip_suffix(".json") {
        let new_path_and_query = match request.uri().query() {
            Some(query) => format!("{stripped}?{query}"),
            None => stripped.to_string(),
        };
        let mut parts = request.uri().clone().into_parts();
        if let Ok(pq) = new_path_and_query.parse() {
            parts.path_and_query = Some(pq);
            if let Ok(uri) = Uri::from_parts(parts) {
                *request.uri_mut() = uri;
            }
        }
    }
    next.run(request).await
}

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer(request.headers(), request.uri())?;
    let user_id = state.verifier.verify(&token).await?;
    request.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(request).await)
}

/// Bearer token lookup order: `Authorization` header, `jwtoken` cookie,
/// `jwtoken` query parameter.
fn extract_bearer(headers: &HeaderMap, uri: &Uri) -> Result<String, AuthError> {
    if let Some(authz) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        let token = authz
            .strip_prefix("Bearer ")
            .or_else(|| authz.strip_prefix("bearer "))
            .ok_or(AuthError::InvalidToken)?;
        if token.trim().is_empty() {
            return Err(AuthError::InvalidToken);
        }
        return Ok(token.trim().to_string());
    }

    if let Some(token) = cookie_value(headers, JWT_COOKIE) {
        return Ok(token);
    }

    if let Some(token) = query_param(uri, JWT_QUERY) {
        return Ok(token);
    }

    Err(AuthError::MissingToken)
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(header::COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if key.trim() == name && !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    for pair in uri.query()?.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key == name && !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}
