//! Canonical bus topic constants shared by the server and the worker.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Tasks
pub const TOPIC_TASKS_CHANGED: &str = "tasks.changed";
