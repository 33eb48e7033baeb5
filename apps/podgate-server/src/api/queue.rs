use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{app_state::AppState, responses::ApiError};

/// Read one of the caller's queue items. Items owned by someone else read as
/// missing.
#[utoipa::path(
    get,
    path = "/api/queue/{id}",
    tag = "Queue",
    operation_id = "queue_item_doc",
    params(("id" = String, Path, description = "Queue item id")),
    responses(
        (status = 200, description = "Queue item", body = serde_json::Value),
        (status = 401, description = "Missing or invalid bearer token", body = crate::openapi::ProblemDetails),
        (status = 404, description = "Unknown item", body = crate::openapi::ProblemDetails)
    )
)]
pub async fn queue_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = super::require_user(&state, &headers).await?;
    let item = state
        .kernel()
        .get_queue_item_async(&id)
        .await?
        .filter(|item| item.user_id == user.id)
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!({"ok": true, "item": item})))
}

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// The caller's own queue items, newest first.
#[utoipa::path(
    get,
    path = "/api/queue",
    tag = "Queue",
    operation_id = "queue_list_doc",
    params(("limit" = Option<i64>, Query, description = "Max items (default 20, capped at 100)")),
    responses(
        (status = 200, description = "Queue items", body = serde_json::Value),
        (status = 401, description = "Missing or invalid bearer token", body = crate::openapi::ProblemDetails)
    )
)]
pub async fn queue_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let user = super::require_user(&state, &headers).await?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let items = state
        .kernel()
        .list_queue_items_async(Some(&user.id), limit)
        .await?;
    let pending = items.iter().filter(|i| !i.status.is_terminal()).count();
    Ok(Json(json!({"ok": true, "pending": pending, "items": items})))
}
