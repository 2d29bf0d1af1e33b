use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use mw_events::ChangeEvent;
use mw_kernel::{TaskRow, TaskUpsert};
use mw_topics::TOPIC_TASKS_CHANGED;
use serde::Deserialize;

use crate::{responses, AppState};

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

fn announce_row(state: &AppState, row: &TaskRow) {
    let mut event = ChangeEvent::for_task(&row.id)
        .with_type(&row.task_type)
        .with_status(&row.status);
    if let Some(channel) = &row.source_channel_id {
        event = event.with_channel(channel);
    }
    let outcome = state.announcer().announce(TOPIC_TASKS_CHANGED, &event);
    tracing::debug!(task = %row.id, ?outcome, "task change announced");
}

/// Create or replace a task row, then announce the change.
pub async fn task_upsert(State(state): State<AppState>, Json(req): Json<TaskUpsert>) -> Response {
    if req.id.trim().is_empty() {
        return responses::bad_request("id must not be empty");
    }
    if req.status.trim().is_empty() || req.task_type.trim().is_empty() {
        return responses::bad_request("status and taskType must not be empty");
    }
    match state.kernel().upsert_task_async(&req).await {
        Ok(row) => {
            announce_row(&state, &row);
            Json(row).into_response()
        }
        Err(err) => responses::internal_error(&err),
    }
}

/// Update one task's status (and optional error text), then announce.
pub async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StatusUpdate>,
) -> Response {
    if req.status.trim().is_empty() {
        return responses::bad_request("status must not be empty");
    }
    match state
        .kernel()
        .set_task_status_async(&id, &req.status, req.error.as_deref())
        .await
    {
        Ok(Some(row)) => {
            announce_row(&state, &row);
            Json(row).into_response()
        }
        Ok(None) => responses::not_found(&format!("unknown task `{id}`")),
        Err(err) => responses::internal_error(&err),
    }
}
