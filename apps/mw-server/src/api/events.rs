use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, Sse},
    response::IntoResponse,
};
use mw_core::{Frame, SessionFilter, SessionOptions, StreamQuery, StreamSession};
use mw_events::ChangeBus;
use mw_topics::TOPIC_TASKS_CHANGED;
use tokio_stream::StreamExt as _;

use crate::AppState;

/// Throttled SSE stream of task snapshots.
///
/// Each connection gets its own session task. Dropping the response body
/// closes the frame channel, which ends the session.
pub async fn tasks_sse(
    State(state): State<AppState>,
    Query(q): Query<StreamQuery>,
) -> impl IntoResponse {
    let cfg = &state.config().stream;
    let filter = SessionFilter::from_query(&q, cfg);
    let (tx, rx) = tokio::sync::mpsc::channel::<Frame>(cfg.frame_buffer.max(1));
    let bus: Arc<dyn ChangeBus> = state.bus().clone();
    let session = StreamSession::new(
        TOPIC_TASKS_CHANGED,
        filter,
        SessionOptions::from_config(cfg),
        bus,
        state.kernel().clone(),
        tx,
    );
    tracing::debug!(session = session.id(), "stream client connected");
    tokio::spawn(session.run(state.shutdown_token().child_token()));

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
        .map(|frame| Result::<SseEvent, Infallible>::Ok(to_sse_event(frame)));
    Sse::new(stream)
}

fn to_sse_event(frame: Frame) -> SseEvent {
    if let Frame::Preamble { retry } = frame {
        return SseEvent::default().retry(retry);
    }
    let mut ev = SseEvent::default();
    if let Some(name) = frame.event_name() {
        ev = ev.event(name);
    }
    if let Some(data) = frame.data() {
        ev = ev.data(data.to_string());
    }
    ev
}
