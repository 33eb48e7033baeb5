use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{app_state::AppState, responses::ApiError};

/// Record that the caller is online and make sure the pod is up.
///
/// Pod-control failures are reported inside `pod`, not as an HTTP error.
#[utoipa::path(
    post,
    path = "/api/presence/heartbeat",
    tag = "Presence",
    operation_id = "presence_heartbeat_doc",
    responses(
        (status = 200, description = "Heartbeat recorded", body = crate::openapi::HeartbeatResponse),
        (status = 401, description = "Missing or invalid bearer token", body = crate::openapi::ProblemDetails),
        (status = 500, description = "Store failure", body = crate::openapi::ProblemDetails)
    )
)]
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let user = super::require_user(&state, &headers).await?;
    state.presence().record_heartbeat(&user.id).await?;
    let pod = state.controller().ensure_running().await;
    Ok(Json(json!({"ok": true, "pod": pod})))
}
