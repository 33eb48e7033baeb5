use axum::http::HeaderMap;

use crate::{app_state::AppState, auth::AuthUser, responses::ApiError};

pub mod chat;
pub mod events;
pub mod meta;
pub mod pod;
pub mod presence;
pub mod queue;
pub mod state;

/// Resolve the bearer token on `headers` to a user.
pub(crate) async fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    Ok(crate::auth::authenticate(state.verifier(), headers).await?)
}
