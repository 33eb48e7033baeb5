use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;

use crate::{auth::AuthError, pod_control::PodControlError, queue::AdmissionError};

/// Handler error rendered as a problem-details body that also carries the
/// legacy `ok`/`error` keys.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{0}")]
    Validation(&'static str),
    #[error("queue full ({active}/{limit})")]
    QueueFull { limit: usize, active: usize },
    #[error("{0}")]
    PodControl(String),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::QueueFull { limit, active } => ApiError::QueueFull { limit, active },
            AdmissionError::Store(err) => ApiError::Internal(err),
        }
    }
}

impl From<PodControlError> for ApiError {
    fn from(err: PodControlError) -> Self {
        ApiError::PodControl(err.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PodControl(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Auth(err) => err.code(),
            ApiError::Validation(code) => *code,
            ApiError::QueueFull { .. } => "queue_full",
            ApiError::PodControl(_) => "pod_control_failed",
            ApiError::NotFound => "not_found",
            ApiError::Internal(_) => "internal",
        }
    }
}

pub fn problem(status: StatusCode, code: &str, detail: Option<String>) -> Value {
    let mut body = json!({
        "ok": false,
        "error": code,
        "type": "about:blank",
        "title": status.canonical_reason().unwrap_or("Error"),
        "status": status.as_u16(),
    });
    if let (Some(detail), Value::Object(map)) = (detail, &mut body) {
        map.insert("detail".into(), Value::String(detail));
    }
    body
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            ApiError::Auth(_) | ApiError::Validation(_) | ApiError::NotFound => None,
            ApiError::QueueFull { .. } | ApiError::PodControl(_) => Some(self.to_string()),
            ApiError::Internal(err) => {
                error!(target: "podgate::http", error = %format!("{err:#}"), "request failed");
                Some(err.to_string())
            }
        };
        let mut body = problem(status, self.code(), detail);
        if let (ApiError::QueueFull { limit, active }, Value::Object(map)) = (&self, &mut body) {
            map.insert("limit".into(), json!(limit));
            map.insert("active".into(), json!(active));
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: ApiError) -> (StatusCode, Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn queue_full_carries_limit_and_active() {
        let (status, body) = body_of(ApiError::QueueFull { limit: 5, active: 5 }).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "queue_full");
        assert_eq!(body["status"], 429);
        assert_eq!(body["title"], "Too Many Requests");
        assert_eq!(body["limit"], 5);
    }

    #[tokio::test]
    async fn auth_errors_map_to_401_codes() {
        let (status, body) = body_of(ApiError::Auth(AuthError::MissingBearer)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_bearer");
        assert!(body.get("detail").is_none());

        let (_, body) = body_of(ApiError::Auth(AuthError::Backend("down".into()))).await;
        assert_eq!(body["error"], "invalid_token");
    }

    #[tokio::test]
    async fn validation_uses_its_code() {
        let (status, body) = body_of(ApiError::Validation("missing_text")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_text");
        assert_eq!(body["type"], "about:blank");
    }
}
