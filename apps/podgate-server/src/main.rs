use std::time::Duration;
use tracing::{error, info, warn};

mod access_log;
mod api;
mod app_state;
mod auth;
mod bootstrap;
mod clock;
mod config;
mod controller;
mod http_client;
mod inference;
mod model_state;
mod openapi;
mod pod_control;
mod presence;
mod prompt;
mod queue;
mod responses;
mod router;
mod singleflight;
mod tasks;
#[cfg(test)]
mod test_support;
mod worker;

#[tokio::main]
async fn main() {
    match bootstrap::ensure_openapi_export() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(err) => {
            eprintln!("error: failed to write generated OPENAPI_OUT: {err:#}");
            std::process::exit(2);
        }
    }

    podgate_otel::init();

    let config = match config::ControlConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let addr = match config.addr() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    let bootstrap::BootstrapOutput {
        router,
        background_tasks,
    } = match bootstrap::build(config) {
        Ok(out) => out,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, "bind server socket: {err}");
            std::process::exit(1);
        }
    };
    info!(%addr, "control plane listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod http_tests {
    use crate::test_support::{self, TestContext, ALICE_TOKEN, BOB_TOKEN};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    async fn call(
        ctx: &TestContext,
        method: &str,
        uri: &str,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let resp = ctx
            .router()
            .oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let ctx = test_support::context(5);
        let (status, body) = call(&ctx, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn heartbeat_starts_an_exited_pod() {
        let ctx = test_support::context(5);
        let (status, body) =
            call(&ctx, "POST", "/api/presence/heartbeat", Some(ALICE_TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["pod"]["ok"], true);
        assert_eq!(body["pod"]["action"], "starting");
        assert_eq!(ctx.pod.calls(), (1, 1, 0));
        assert!(ctx.state.kernel().get_presence("alice").unwrap().is_some());
    }

    #[tokio::test]
    async fn heartbeat_reports_pod_failure_in_body() {
        let ctx = test_support::context(5);
        ctx.pod.fail_start(true);
        let (status, body) =
            call(&ctx, "POST", "/api/presence/heartbeat", Some(ALICE_TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pod"]["ok"], false);
        assert!(body["pod"]["error"].is_string());
    }

    #[tokio::test]
    async fn heartbeat_requires_token() {
        let ctx = test_support::context(5);
        let (status, body) = call(&ctx, "POST", "/api/presence/heartbeat", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);
        assert_eq!(ctx.pod.calls(), (0, 0, 0));
    }

    #[tokio::test]
    async fn pod_status_reads_through() {
        let ctx = test_support::context(5);
        let (status, body) = call(&ctx, "GET", "/api/pod/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pod"]["desiredStatus"], "EXITED");

        ctx.pod.fail_describe(true);
        let (status, body) = call(&ctx, "GET", "/api/pod/status", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "pod_control_failed");
    }

    #[tokio::test]
    async fn queue_items_are_private_to_their_owner() {
        let ctx = test_support::context(5);
        let item = ctx
            .state
            .queue()
            .enqueue("alice", None, "hello")
            .await
            .unwrap();
        let uri = format!("/api/queue/{}", item.id);

        let (status, body) = call(&ctx, "GET", &uri, Some(ALICE_TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["item"]["id"], item.id.as_str());
        assert_eq!(body["item"]["status"], "queued");

        let (status, body) = call(&ctx, "GET", &uri, Some(BOB_TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = call(&ctx, "GET", "/api/queue/missing", Some(ALICE_TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn queue_listing_shows_only_the_callers_items() {
        let ctx = test_support::context(10);
        let queue = ctx.state.queue();
        queue.enqueue("alice", None, "a1").await.unwrap();
        queue.enqueue("bob", None, "b1").await.unwrap();
        queue.enqueue("alice", Some("c1"), "a2").await.unwrap();

        let (status, body) = call(&ctx, "GET", "/api/queue", Some(ALICE_TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i["user_id"] == "alice"));
        assert_eq!(body["pending"], 2);

        let (_, body) = call(&ctx, "GET", "/api/queue?limit=1", Some(ALICE_TOKEN)).await;
        assert_eq!(body["items"].as_array().unwrap().len(), 1);

        let (status, _) = call(&ctx, "GET", "/api/queue", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn state_snapshot_counts_queue() {
        let ctx = test_support::context(3);
        ctx.state
            .queue()
            .enqueue("alice", None, "one")
            .await
            .unwrap();
        let (status, body) = call(&ctx, "GET", "/api/state", Some(ALICE_TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"]["capacity"], 3);
        assert_eq!(body["queue"]["by_status"]["queued"], 1);
        assert_eq!(body["online"], false);
    }
}
