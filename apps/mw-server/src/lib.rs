//! HTTP surface for task status: throttled SSE streams, one-shot snapshots,
//! worker liveness and the task mutation endpoints that announce changes.

mod api;
mod app_state;
pub mod responses;
mod router;

pub use app_state::AppState;
pub use router::build_router;
