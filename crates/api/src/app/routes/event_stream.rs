//! Live event feed for dashboards and operational monitoring.
//!
//! Streams every `SyncEvent` published after the client connects as
//! Server-Sent Events. The SSE event name is the event type
//! (`sync.conflict_detected`, ...) and the data is the JSON envelope.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{Extension, Query},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
};
use serde::Deserialize;
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use stocksync_engine::SyncEvent;
use stocksync_events::{EventBus, EventEnvelope};

use crate::app::services::AppServices;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub fn router() -> Router {
    Router::new().route("/stream", get(stream_events))
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamFilter {
    /// Only forward events whose type starts with this prefix.
    #[serde(default)]
    pub prefix: Option<String>,
}

/// GET /events/stream?prefix=sync.conflict
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    Query(filter): Query<StreamFilter>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
    let subscription = match filter.prefix {
        Some(prefix) => services.event_bus.subscribe_where(Box::new(move |envelope: &EventEnvelope<SyncEvent>| {
            envelope.event_type().starts_with(&prefix)
        })),
        None => services.event_bus.subscribe(),
    };

    // the subscription is a blocking receiver: forward from a blocking task
    tokio::task::spawn_blocking(move || {
        let mut last_sent = Instant::now();
        loop {
            match subscription.recv_timeout(POLL_INTERVAL) {
                Ok(envelope) => {
                    let data = match serde_json::to_string(&envelope) {
                        Ok(data) => data,
                        Err(err) => {
                            tracing::warn!(event_type = envelope.event_type(), error = %err, "event not serializable");
                            continue;
                        }
                    };
                    let event = SseEvent::default().event(envelope.event_type()).data(data);
                    if tx.send(Ok(event)).is_err() {
                        break;
                    }
                    last_sent = Instant::now();
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if tx.is_closed() {
                        break;
                    }
                    if last_sent.elapsed() > HEARTBEAT_INTERVAL {
                        if tx.send(Ok(SseEvent::default().event("heartbeat").data("{}"))).is_err() {
                            break;
                        }
                        last_sent = Instant::now();
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("event stream closed");
    });

    Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL))
}
