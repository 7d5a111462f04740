//! HTTP surface: state, router assembly, and the server loop.
//!
//! Middleware order is deterministic: trailing-slash normalization (applied
//! around the whole router at serve time) → request-id → access log → panic
//! recovery → URL-extension strip → forced JSON content type → per-IP rate
//! limit. Protected routes additionally run bearer authentication.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderValue};
use axum::routing::{get, patch, post};
use axum::Router;
use tower::{Layer as _, ServiceBuilder};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::db::Database;
use crate::error::ServerError;
use crate::sso::SsoClient;

use self::middleware::{MakeRequestUlid, RateLimiter};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub sso: Arc<dyn SsoClient>,
    pub verifier: Arc<TokenVerifier>,
    pub config: Arc<Config>,
    pub rate_limiter: RateLimiter,
    pub startup_time: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn Database>,
        sso: Arc<dyn SsoClient>,
        verifier: Arc<TokenVerifier>,
    ) -> Self {
        Self {
            db,
            sso,
            verifier,
            config,
            rate_limiter: RateLimiter::new(Duration::from_secs(60)),
            startup_time: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/register", post(handlers::auth::register))
        .route("/login", post(handlers::auth::login))
        .route("/verify-email", post(handlers::auth::verify_email))
        .route("/refresh-tokens", post(handlers::auth::refresh_tokens))
        .route("/password/reset", get(handlers::auth::reset_password))
        .route("/password/change", post(handlers::auth::change_password))
        .route("/health", get(handlers::health));

    let protected = Router::new()
        .route("/logout", post(handlers::auth::logout))
        .route("/statuses", get(handlers::statuses::list_statuses))
        .route("/statuses/{status_id}", get(handlers::statuses::get_status))
        .route(
            "/user",
            get(handlers::user::get_user)
                .patch(handlers::user::update_user)
                .delete(handlers::user::delete_user),
        )
        .route(
            "/user/lists",
            get(handlers::lists::list_lists).post(handlers::lists::create_list),
        )
        .route(
            "/user/lists/default",
            get(handlers::lists::get_default_list)
                .post(handlers::lists::create_task_in_default),
        )
        .route(
            "/user/lists/{list_id}",
            get(handlers::lists::get_list)
                .patch(handlers::lists::update_list)
                .delete(handlers::lists::delete_list),
        )
        .route(
            "/user/lists/{list_id}/tasks",
            get(handlers::lists::tasks_by_list).post(handlers::lists::create_task_in_list),
        )
        .route(
            "/user/lists/{list_id}/headings",
            get(handlers::headings::list_headings).post(handlers::headings::create_heading),
        )
        .route(
            "/user/lists/{list_id}/headings/tasks",
            get(handlers::headings::heading_groups),
        )
        .route(
            "/user/lists/{list_id}/headings/{heading_id}",
            get(handlers::headings::get_heading)
                .post(handlers::headings::create_task_in_heading)
                .patch(handlers::headings::update_heading)
                .delete(handlers::headings::delete_heading),
        )
        .route(
            "/user/lists/{list_id}/headings/{heading_id}/move",
            patch(handlers::headings::move_heading),
        )
        .route("/user/tasks", get(handlers::tasks::tasks_by_user))
        .route("/user/tasks/today", get(handlers::views::today))
        .route("/user/tasks/upcoming", get(handlers::views::upcoming))
        .route("/user/tasks/overdue", get(handlers::views::overdue))
        .route("/user/tasks/someday", get(handlers::views::someday))
        .route("/user/tasks/completed", get(handlers::views::completed))
        .route("/user/tasks/archived", get(handlers::views::archived))
        .route(
            "/user/tasks/{task_id}",
            get(handlers::tasks::get_task).patch(handlers::tasks::update_task),
        )
        .route("/user/tasks/{task_id}/time", patch(handlers::tasks::update_time))
        .route(
            "/user/tasks/{task_id}/move/list",
            patch(handlers::tasks::move_to_list),
        )
        .route(
            "/user/tasks/{task_id}/move/heading",
            patch(handlers::tasks::move_to_heading),
        )
        .route("/user/tasks/{task_id}/complete", patch(handlers::tasks::complete))
        .route("/user/tasks/{task_id}/archive", patch(handlers::tasks::archive))
        .route("/user/tags", get(handlers::tags::list_tags))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authenticate,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUlid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new())
                .layer(axum::middleware::from_fn(middleware::strip_url_extension))
                .layer(SetResponseHeaderLayer::overriding(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::rate_limit,
                ))
                .layer(TimeoutLayer::new(state.config.http.timeout)),
        )
        .with_state(state)
}

/// Bind and serve until a shutdown signal arrives; open connections get
/// the idle timeout to drain before the process gives up on them.
pub async fn serve(state: AppState) -> Result<(), ServerError> {
    let addr = state.config.http.address;
    let drain_deadline = state.config.http.idle_timeout;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    tracing::info!(%addr, "http server listening");

    let app = router(state);
    let app = NormalizePathLayer::trim_trailing_slash().layer(app);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        use axum::ServiceExt;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining connections");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(drain_deadline, server).await {
        Ok(joined) => joined
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))?
            .map_err(ServerError::Io),
        Err(_) => {
            tracing::warn!(deadline = ?drain_deadline, "drain deadline exceeded, aborting");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
