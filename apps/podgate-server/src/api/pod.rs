use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::{app_state::AppState, responses::ApiError};

/// Read-through of the pod API.
#[utoipa::path(
    get,
    path = "/api/pod/status",
    tag = "Pod",
    operation_id = "pod_status_doc",
    responses(
        (status = 200, description = "Pod description", body = crate::openapi::PodStatusResponse),
        (status = 500, description = "Pod API failure", body = crate::openapi::ProblemDetails)
    )
)]
pub async fn pod_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pod = state.pod().describe().await?;
    Ok(Json(json!({"ok": true, "pod": pod})))
}
