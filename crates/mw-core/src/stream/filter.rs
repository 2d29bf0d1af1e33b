use std::time::Duration;

use mw_events::ChangeEvent;
use mw_kernel::TaskFilter;
use serde::Deserialize;

use crate::config::StreamConfig;

/// Client-supplied stream parameters, straight from the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub channel: Option<String>,
    pub task: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub limit: Option<u32>,
    pub min_interval_ms: Option<u64>,
}

/// Normalised per-session filter: scope keys, row filters and clamped limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFilter {
    pub channel: Option<String>,
    pub task: Option<String>,
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub max_rows: u32,
    pub min_interval: Duration,
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl SessionFilter {
    pub fn from_query(query: &StreamQuery, cfg: &StreamConfig) -> Self {
        Self {
            channel: non_empty(&query.channel),
            task: non_empty(&query.task),
            status: non_empty(&query.status),
            task_type: non_empty(&query.task_type),
            max_rows: cfg.clamp_rows(query.limit),
            min_interval: cfg.clamp_interval(query.min_interval_ms),
        }
    }

    pub fn task_filter(&self) -> TaskFilter {
        TaskFilter {
            task_id: self.task.clone(),
            source_channel_id: self.channel.clone(),
            status: self.status.clone(),
            task_type: self.task_type.clone(),
            limit: self.max_rows,
        }
    }

    /// Scope check for an incoming notification. Only the scope keys are
    /// compared: a status change can move a row out of a status filter, and
    /// the client still needs the snapshot that drops it. Events without the
    /// scope field are let through.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if let (Some(want), Some(got)) = (&self.channel, &event.source_channel_id) {
            if want != got {
                return false;
            }
        }
        if let (Some(want), Some(got)) = (&self.task, &event.task_id) {
            if want != got {
                return false;
            }
        }
        true
    }
}
