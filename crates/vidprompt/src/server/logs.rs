//! Activity feed routes.
//!
//! The stream replays the run's buffered events, marks the hand-over with
//! `event: ready`, then forwards live events until the client goes away.
//! Snapshot and subscription are taken atomically, so nothing is lost or
//! repeated at the seam.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use consensus::events::subscribe_channel_with_snapshot;
use consensus::{ActivityEvent, ActivityPhase, SharedActivityBus, Subscription};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::{ApiError, AppState};

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Unsubscribes and sweeps idle runs when the client disconnects.
struct FeedGuard {
    bus: SharedActivityBus,
    run_id: String,
    subscription: Option<Subscription>,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        let evicted = self.bus.cleanup_expired();
        debug!(run_id = %self.run_id, evicted, "activity feed closed");
    }
}

/// Event stream that owns its [`FeedGuard`].
struct GuardedStream {
    inner: EventStream,
    _guard: FeedGuard,
}

impl Stream for GuardedStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

fn event_frame(event: &ActivityEvent) -> Result<Event, Infallible> {
    Ok(match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            warn!(error = %e, "dropping unserializable activity event");
            Event::default().comment("skipped")
        }
    })
}

/// `GET /api/logs/:runId/stream`
pub async fn stream(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = run_id.trim().to_string();
    if run_id.is_empty() {
        return Err(ApiError::bad_request("Missing runId"));
    }

    let (snapshot, subscription, rx) = subscribe_channel_with_snapshot(&state.bus, &run_id);
    debug!(run_id = %run_id, replay = snapshot.len(), "activity feed opened");

    let replay = stream::iter(snapshot.iter().map(event_frame).collect::<Vec<_>>());
    let ready = stream::iter([
        Ok(Event::default().comment("stream-start")),
        Ok(Event::default().event("ready").data(json!({ "ok": true }).to_string())),
    ]);
    let live = UnboundedReceiverStream::new(rx).map(|event| event_frame(&event));

    let body = GuardedStream {
        inner: Box::pin(replay.chain(ready).chain(live)),
        _guard: FeedGuard {
            bus: state.bus.clone(),
            run_id,
            subscription: Some(subscription),
        },
    };

    let sse = Sse::new(body).keep_alive(
        KeepAlive::new()
            .interval(state.config.server.keep_alive())
            .text("ok"),
    );
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    ))
}

/// Body of a dev emit request. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct EmitRequest {
    pub phase: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub message: Option<String>,
    pub data: Option<Value>,
}

/// `POST /api/logs/:runId/emit`: append one hand-made event (development only).
pub async fn emit(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if state.is_production() {
        return Err(ApiError::NotFound);
    }
    let run_id = run_id.trim();
    if run_id.is_empty() {
        return Err(ApiError::bad_request("Missing runId"));
    }

    // Unparseable bodies fall back to all defaults.
    let request: EmitRequest = serde_json::from_slice(&body).unwrap_or_default();
    let phase = match request.phase.as_deref() {
        Some(raw) => raw.parse::<ActivityPhase>().map_err(ApiError::BadRequest)?,
        None => ActivityPhase::Init,
    };
    let mut event = ActivityEvent::new(
        phase,
        request.kind.unwrap_or_else(|| "dev_emit".to_string()),
        request.message.unwrap_or_else(|| "dev test event".to_string()),
    );
    if let Some(data) = request.data {
        event = event.with_data(data);
    }
    state.bus.append(run_id, event);
    Ok(Json(json!({ "ok": true })))
}
