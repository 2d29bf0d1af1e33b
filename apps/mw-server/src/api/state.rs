use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::SecondsFormat;
use mw_core::{SessionFilter, StreamQuery};
use serde_json::json;

use crate::{responses, AppState};

/// Worker liveness derived from the latest heartbeat record.
pub async fn worker_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.liveness().status().await)
}

/// One-shot snapshot using the same filter parameters as the stream.
pub async fn tasks_snapshot(
    State(state): State<AppState>,
    Query(q): Query<StreamQuery>,
) -> Response {
    let filter = SessionFilter::from_query(&q, &state.config().stream);
    match state.kernel().list_tasks_async(&filter.task_filter()).await {
        Ok(tasks) => Json(json!({
            "ts": chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "tasks": tasks,
        }))
        .into_response(),
        Err(err) => responses::internal_error(&err),
    }
}
