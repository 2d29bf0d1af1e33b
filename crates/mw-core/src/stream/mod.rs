//! Per-client streaming sessions: filter parsing, output frames and the
//! throttled session loop.

mod filter;
mod frame;
mod session;

pub use filter::{SessionFilter, StreamQuery};
pub use frame::Frame;
pub use session::{SessionOptions, SessionState, SnapshotSource, StreamSession};
