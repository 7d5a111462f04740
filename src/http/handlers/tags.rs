//! Tag listing. Tags are created implicitly through task writes.

use axum::extract::State;
use axum::response::Response;
use axum::Extension;

use crate::error::DomainError;
use crate::http::error::ApiError;
use crate::http::middleware::AuthUser;
use crate::http::types::ok;
use crate::http::AppState;

pub async fn list_tags(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Response, ApiError> {
    let tags = state.db.list_tags(&user_id).await?;
    if tags.is_empty() {
        return Err(ApiError::domain(DomainError::NoTagsFound));
    }
    Ok(ok("tags", tags))
}
