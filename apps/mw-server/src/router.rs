use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{api, AppState};

pub mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const STATE_WORKER: &str = "/state/worker";
    pub const STATE_TASKS: &str = "/state/tasks";
    pub const EVENTS_TASKS: &str = "/events/tasks";
    pub const ADMIN_TASKS: &str = "/admin/tasks";
    pub const ADMIN_TASK_STATUS: &str = "/admin/tasks/{id}/status";
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(paths::HEALTHZ, get(api::meta::healthz))
        .route(paths::STATE_WORKER, get(api::state::worker_status))
        .route(paths::STATE_TASKS, get(api::state::tasks_snapshot))
        .route(paths::EVENTS_TASKS, get(api::events::tasks_sse))
        .route(paths::ADMIN_TASKS, post(api::admin::task_upsert))
        .route(paths::ADMIN_TASK_STATUS, post(api::admin::task_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
