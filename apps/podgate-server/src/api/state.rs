use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Map, Value};

use crate::{app_state::AppState, responses::ApiError};

/// Model-state singleton plus queue depth per status.
#[utoipa::path(
    get,
    path = "/api/state",
    tag = "State",
    operation_id = "state_snapshot_doc",
    responses(
        (status = 200, description = "Control-plane snapshot", body = serde_json::Value),
        (status = 401, description = "Missing or invalid bearer token", body = crate::openapi::ProblemDetails)
    )
)]
pub async fn state_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    super::require_user(&state, &headers).await?;
    let model = state.model_state().snapshot().await?;
    let counts = state.kernel().count_queue_by_status_async().await?;
    let by_status: Map<String, Value> = counts
        .into_iter()
        .map(|(status, n)| (status.as_str().to_string(), json!(n)))
        .collect();
    let online = state
        .presence()
        .is_anyone_online(state.config().presence.window_secs)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "model_state": model,
        "online": online,
        "queue": {
            "capacity": state.queue().capacity(),
            "by_status": by_status,
        },
    })))
}
