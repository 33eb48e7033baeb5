use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use podgate_otel::ACCESS_TARGET;
use std::time::Instant;

static ENABLED: Lazy<bool> = Lazy::new(|| {
    matches!(
        std::env::var("PODGATE_ACCESS_LOG").ok().as_deref(),
        Some("1") | Some("true")
    ) || std::env::var("PODGATE_ACCESS_LOG_ROLL").ok().as_deref() == Some("1")
});

/// One `http.access` event per request: method, matched route, status and
/// latency. Never logs headers, so bearer tokens stay out of the log.
pub async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    if !*ENABLED {
        return next.run(req).await;
    }
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let res = next.run(req).await;
    let dur_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        target: ACCESS_TARGET,
        method = method.as_str(),
        path = %path,
        status = res.status().as_u16(),
        dur_ms,
        "request"
    );
    res
}
