use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct HealthOk {
    pub ok: bool,
    pub name: String,
}

/// Error body: RFC 7807 fields plus the legacy `ok`/`error` pair.
#[allow(dead_code)]
#[derive(Serialize, ToSchema)]
pub struct ProblemDetails {
    pub ok: bool,
    #[schema(example = "queue_full")]
    pub error: String,
    #[serde(rename = "type")]
    #[schema(example = "about:blank")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    #[schema(nullable, value_type = Option<String>)]
    pub detail: Option<String>,
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct ChatSubmitRequest {
    #[schema(nullable, value_type = Option<String>)]
    pub conversation_id: Option<String>,
    pub text: String,
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub pod: crate::controller::ControlReport,
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct PodStatusResponse {
    pub ok: bool,
    pub pod: crate::pod_control::PodInfo,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::meta::health,
        crate::api::presence::heartbeat,
        crate::api::pod::pod_status,
        crate::api::chat::chat_submit,
        crate::api::queue::queue_list,
        crate::api::queue::queue_item,
        crate::api::state::state_snapshot,
        crate::api::events::events_sse,
    ),
    components(
        schemas(
            HealthOk,
            ProblemDetails,
            ChatSubmitRequest,
            HeartbeatResponse,
            PodStatusResponse,
            crate::controller::ControlReport,
            crate::controller::ControlAction,
            crate::pod_control::PodInfo,
            crate::pod_control::PodRuntime,
            crate::pod_control::PodPort,
        )
    ),
    tags(
        (name = "Meta", description = "Service health"),
        (name = "Presence", description = "User liveness and pod wake-up"),
        (name = "Pod", description = "Pod API read-through"),
        (name = "Chat", description = "Chat submission queue"),
        (name = "Queue", description = "Queue item lookup and listing"),
        (name = "State", description = "Control-plane snapshot"),
        (name = "Events", description = "Server-Sent Events stream")
    )
)]
pub struct ApiDoc;
