use std::mem;

use axum::{
    handler::Handler,
    routing::{get, post},
    Router,
};

use crate::{api, app_state::AppState};

pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("GET {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn route_post<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.endpoints.push(format!("POST {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, post(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) mod paths {
    pub const HEALTH: &str = "/health";
    pub const PRESENCE_HEARTBEAT: &str = "/api/presence/heartbeat";
    pub const POD_STATUS: &str = "/api/pod/status";
    pub const CHAT: &str = "/api/chat";
    pub const QUEUE: &str = "/api/queue";
    pub const QUEUE_ID: &str = "/api/queue/{id}";
    pub const STATE: &str = "/api/state";
    pub const EVENTS: &str = "/api/events";
}

pub(crate) fn build_router() -> (Router<AppState>, Vec<String>) {
    let mut builder = RouterBuilder::new();
    builder
        .route_get(paths::HEALTH, api::meta::health)
        .route_post(paths::PRESENCE_HEARTBEAT, api::presence::heartbeat)
        .route_get(paths::POD_STATUS, api::pod::pod_status)
        .route_post(paths::CHAT, api::chat::chat_submit)
        .route_get(paths::QUEUE, api::queue::queue_list)
        .route_get(paths::QUEUE_ID, api::queue::queue_item)
        .route_get(paths::STATE, api::state::state_snapshot)
        .route_get(paths::EVENTS, api::events::events_sse);
    builder.build()
}
