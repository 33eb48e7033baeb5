use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};
use tracing::warn;

use crate::{app_state::AppState, responses::ApiError};

/// Parsed leniently so that a missing or non-string `text` is a 400
/// `missing_text` rather than an extractor rejection.
fn parse_submission(body: &[u8]) -> Result<(Option<String>, String), ApiError> {
    let doc: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let text = doc
        .get("text")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::Validation("missing_text"))?;
    let conversation_id = doc
        .get("conversation_id")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Ok((conversation_id, text.to_string()))
}

/// Submit a chat turn to the FIFO queue.
#[utoipa::path(
    post,
    path = "/api/chat",
    tag = "Chat",
    operation_id = "chat_submit_doc",
    request_body = crate::openapi::ChatSubmitRequest,
    responses(
        (status = 200, description = "Queued", body = serde_json::Value),
        (status = 400, description = "Missing text", body = crate::openapi::ProblemDetails),
        (status = 401, description = "Missing or invalid bearer token", body = crate::openapi::ProblemDetails),
        (status = 429, description = "Queue full", body = crate::openapi::ProblemDetails),
        (status = 500, description = "Pod control or store failure", body = crate::openapi::ProblemDetails)
    )
)]
pub async fn chat_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let user = super::require_user(&state, &headers).await?;
    let (conversation_id, text) = parse_submission(&body)?;

    if let Err(err) = state.presence().record_heartbeat(&user.id).await {
        warn!(target: "podgate::http", user_id = %user.id, error = %err, "presence update failed");
    }

    let pod = state.controller().ensure_running().await;
    if !pod.ok {
        return Err(ApiError::PodControl(
            pod.error.unwrap_or_else(|| "pod control failed".into()),
        ));
    }

    let item = state
        .queue()
        .enqueue(&user.id, conversation_id.as_deref(), &text)
        .await?;
    Ok(Json(json!({"ok": true, "queued": item})))
}
