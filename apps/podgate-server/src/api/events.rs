use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::{stream, StreamExt};
use podgate_events::Envelope;
use tokio_stream::wrappers::BroadcastStream;

use crate::app_state::AppState;

const MAX_REPLAY: usize = 256;

/// Envelopes naming a `user_id` go only to that user; the rest are
/// control-plane wide.
fn visible_to(env: &Envelope, user_id: &str) -> bool {
    match env.payload.get("user_id").and_then(|v| v.as_str()) {
        Some(owner) => owner == user_id,
        None => true,
    }
}

fn to_sse(env: &Envelope) -> SseEvent {
    SseEvent::default()
        .event(env.kind.clone())
        .data(serde_json::to_string(env).unwrap_or_else(|_| "{}".to_string()))
}

/// Server-Sent Events stream of bus envelopes. Events about other users are
/// withheld.
#[utoipa::path(
    get,
    path = "/api/events",
    tag = "Events",
    operation_id = "events_sse_doc",
    params(
        ("replay" = Option<usize>, Query, description = "Replay the last N events before following live")
    ),
    responses(
        (status = 200, description = "SSE stream of events", content_type = "text/event-stream"),
        (status = 401, description = "Missing or invalid bearer token", body = crate::openapi::ProblemDetails)
    )
)]
pub async fn events_sse(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let user = match super::require_user(&state, &headers).await {
        Ok(user) => user,
        Err(err) => return err.into_response(),
    };
    let replay = q
        .get("replay")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_default()
        .min(MAX_REPLAY);

    // Subscribe before reading the ring so nothing published in between is lost.
    let live_user = user.id.clone();
    let live = BroadcastStream::new(state.bus().subscribe())
        .filter_map(move |res| {
            let env = res.ok().filter(|env| visible_to(env, &live_user));
            async move { env }
        })
        .map(|env| Ok::<_, Infallible>(to_sse(&env)));
    let replayed: Vec<Result<SseEvent, Infallible>> = if replay > 0 {
        let visible: Vec<Envelope> = state
            .bus()
            .replay(MAX_REPLAY)
            .into_iter()
            .filter(|env| visible_to(env, &user.id))
            .collect();
        let skip = visible.len().saturating_sub(replay);
        visible[skip..].iter().map(|env| Ok(to_sse(env))).collect()
    } else {
        Vec::new()
    };
    let events = stream::iter(replayed).chain(live);

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
