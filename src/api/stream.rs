use axum::response::sse::{Event as SseEvent, Sse};
use axum::{extract::State, response::IntoResponse};
use chrono::Utc;
use futures::Stream;
use serde_json::json;
use std::convert::Infallible;
use tracing::{debug, trace};

use crate::{
    api::{ApiState, auth::AuthUser},
    events::{Event, tenant_for},
};

/// Header carrying the client's last seen event id on reconnect.
const LAST_EVENT_ID: &str = "last-event-id";

fn wire_event(event: &Event) -> SseEvent {
    SseEvent::default()
        .id(event.id.clone())
        .event(event.payload.kind())
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

/// Synthetic per-connection events (`connected`, `heartbeat`,
/// `connection_limit`) are not replayable and carry no id.
fn synthetic_event(kind: &str) -> SseEvent {
    SseEvent::default().event(kind).data(
        json!({ "type": kind, "timestamp": Utc::now().to_rfc3339() }).to_string(),
    )
}

/// The long-lived notification stream: replays missed events from the
/// ring, then follows live traffic with heartbeats, a per-user
/// concurrent-stream cap and a hard lifetime that forces re-auth.
pub async fn event_stream(
    State(state): State<ApiState>,
    user: AuthUser,
    headers: http::HeaderMap,
) -> impl IntoResponse {
    let tenant = tenant_for(user.user_id);
    let last_seen = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let permit = state.stream_limits.try_acquire(user.user_id);
    let bus = state.bus.clone();
    let heartbeat_interval = state.config.heartbeat_interval;
    let stream_lifetime = state.config.stream_lifetime;

    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>> =
        Box::pin(async_stream::stream! {
            // over the per-user cap: the newest connection is told and closed,
            // existing streams are untouched
            let Some(_permit) = permit else {
                debug!(user_id = user.user_id.to_string(), "stream cap exceeded");
                yield Ok(synthetic_event("connection_limit"));
                return;
            };

            yield Ok(synthetic_event("connected"));

            // catch-up before live traffic, only when the client brings a
            // last seen id; an unknown id yields nothing and the client
            // starts from scratch
            let backlog = if last_seen.is_empty() {
                Vec::new()
            } else {
                bus.get_since(&tenant, &last_seen, usize::MAX)
            };
            trace!(
                user_id = user.user_id.to_string(),
                replayed = backlog.len(),
                "stream catch-up"
            );
            for event in backlog {
                yield Ok(wire_event(&event));
            }

            let mut subscription = bus.subscribe(&tenant);

            let deadline = tokio::time::sleep(stream_lifetime);
            tokio::pin!(deadline);

            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await; // the first tick fires immediately

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        debug!(user_id = user.user_id.to_string(), "stream lifetime reached");
                        break;
                    }
                    _ = heartbeat.tick() => {
                        yield Ok(synthetic_event("heartbeat"));
                    }
                    event = subscription.recv() => {
                        match event {
                            Some(event) => yield Ok(wire_event(&event)),
                            None => break,
                        }
                    }
                }
            }

            // dropping the subscription and permit releases both slots
        });

    Sse::new(stream)
}
