use std::time::Duration;

use mw_kernel::TaskRow;
use serde_json::json;

/// One unit of output from a streaming session, independent of transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reconnect delay hint, sent once before anything else.
    Preamble { retry: Duration },
    /// A full snapshot of the session's filtered task set.
    Tasks { ts: String, tasks: Vec<TaskRow> },
    Ping { ts: String },
    ServerError { error: String },
}

impl Frame {
    pub fn tasks(tasks: Vec<TaskRow>) -> Self {
        Frame::Tasks { ts: now_ts(), tasks }
    }

    pub fn ping() -> Self {
        Frame::Ping { ts: now_ts() }
    }

    pub fn server_error(error: impl Into<String>) -> Self {
        Frame::ServerError {
            error: error.into(),
        }
    }

    /// Event name on the wire; the preamble has none.
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            Frame::Preamble { .. } => None,
            Frame::Tasks { .. } => Some("tasks"),
            Frame::Ping { .. } => Some("ping"),
            Frame::ServerError { .. } => Some("server_error"),
        }
    }

    /// Label used for frame counters.
    pub fn kind(&self) -> &'static str {
        self.event_name().unwrap_or("retry")
    }

    /// JSON data body, `None` for the preamble.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            Frame::Preamble { .. } => None,
            Frame::Tasks { ts, tasks } => Some(json!({ "ts": ts, "tasks": tasks })),
            Frame::Ping { ts } => Some(json!({ "ts": ts })),
            Frame::ServerError { error } => Some(json!({ "error": error })),
        }
    }
}

fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
