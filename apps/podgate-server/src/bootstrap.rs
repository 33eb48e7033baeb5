use anyhow::Context as _;
use podgate_events::Bus;
use podgate_kernel::Kernel;
use tracing::{info, warn};
use utoipa::OpenApi;

use crate::{
    access_log,
    app_state::AppState,
    config::ControlConfig,
    controller, openapi,
    router::build_router,
    tasks::TaskManager,
    worker,
};

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<()>,
    pub background_tasks: TaskManager,
}

/// Open the store, wire the collaborators, start the two background loops.
pub(crate) fn build(config: ControlConfig) -> anyhow::Result<BootstrapOutput> {
    let kernel = Kernel::open(&config.state_dir)
        .with_context(|| format!("open state dir {}", config.state_dir.display()))?;
    // Items a previous process left running would hold queue slots forever.
    let swept = kernel
        .fail_orphaned_running(chrono::Utc::now())
        .context("fail orphaned queue items")?;
    if swept > 0 {
        warn!(target: "podgate::queue", swept, "failed queue items interrupted by a previous shutdown");
    }
    let bus = Bus::new_with_replay(256, 256);
    let concurrency = config.http_concurrency;
    let state = AppState::builder(config, kernel, bus)
        .build()
        .context("build collaborators")?;

    let (router, endpoints) = build_router();
    info!(count = endpoints.len(), routes = ?endpoints, "routes registered");

    let mut background_tasks = TaskManager::new();
    background_tasks.push(worker::start_queue_worker(state.clone()));
    background_tasks.push(controller::start_idle_check(state.clone()));
    info!(
        tasks = background_tasks.len(),
        worker_tick_ms = state.config().queue.worker_tick_ms,
        idle_check_secs = state.config().idle.check_interval_secs,
        "background tasks started"
    );

    let router = attach_layers(router.with_state(state), concurrency);
    Ok(BootstrapOutput {
        router,
        background_tasks,
    })
}

pub(crate) fn attach_layers(router: axum::Router<()>, concurrency_limit: usize) -> axum::Router<()> {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .layer(axum::middleware::from_fn(access_log::access_log_mw))
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
}

/// When `OPENAPI_OUT` is set, write the OpenAPI document there and report the
/// path so the caller can exit without serving.
pub(crate) fn ensure_openapi_export() -> anyhow::Result<Option<String>> {
    let Ok(path) = std::env::var("OPENAPI_OUT") else {
        return Ok(None);
    };
    let yaml = openapi::ApiDoc::openapi()
        .to_yaml()
        .context("render openapi yaml")?;
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&path, yaml).with_context(|| format!("write {path}"))?;
    Ok(Some(path))
}
