pub mod config;
pub mod fingerprint;
pub mod liveness;
pub mod notify;
pub mod stream;
pub mod tasks;
pub mod throttle;

pub use config::{load_config, load_from_env, parse_config, Config, ConfigError};
pub use fingerprint::Fingerprint;
pub use liveness::{
    default_process_identity, derive_status, HeartbeatPublisher, LivenessReader, LivenessStatus,
    LivenessStore,
};
pub use notify::{AnnounceOutcome, Announcer};
pub use stream::{Frame, SessionFilter, SessionOptions, SnapshotSource, StreamQuery, StreamSession};
pub use tasks::{spawn_supervised, TaskHandle, TaskManager};
pub use throttle::Throttle;
