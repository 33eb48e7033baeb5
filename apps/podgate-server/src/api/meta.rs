use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app_state::AppState;

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Meta",
    operation_id = "health_doc",
    responses(
        (status = 200, description = "Service healthy", body = crate::openapi::HealthOk)
    )
)]
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"ok": true, "name": state.config().app_name}))
}
