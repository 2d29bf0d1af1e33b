//! Worker liveness: a periodic heartbeat writer and a pure reader that turns
//! the latest record into online/offline plus lag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mw_kernel::{HeartbeatRow, Kernel};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tasks::{spawn_supervised, TaskHandle};

/// Where liveness records live.
#[async_trait]
pub trait LivenessStore: Send + Sync {
    async fn write(&self, record: &HeartbeatRow) -> anyhow::Result<()>;
    async fn read(&self) -> anyhow::Result<Option<HeartbeatRow>>;
}

#[async_trait]
impl LivenessStore for Kernel {
    async fn write(&self, record: &HeartbeatRow) -> anyhow::Result<()> {
        self.put_heartbeat_async(record).await
    }

    async fn read(&self) -> anyhow::Result<Option<HeartbeatRow>> {
        self.get_heartbeat_async().await
    }
}

/// `<HOSTNAME or "worker">:<pid>`
pub fn default_process_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}:{}", host, std::process::id())
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct HeartbeatPublisher {
    store: Arc<dyn LivenessStore>,
    period: Duration,
    started_at: DateTime<Utc>,
    identity: String,
}

impl HeartbeatPublisher {
    pub fn new(store: Arc<dyn LivenessStore>, period: Duration, identity: String) -> Self {
        Self {
            store,
            period,
            started_at: Utc::now(),
            identity,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Overwrite the liveness record with the current time. Failures are
    /// logged and swallowed; the next tick is the retry.
    pub async fn publish_heartbeat(&self) -> bool {
        let record = HeartbeatRow {
            last_heartbeat_at: rfc3339(Utc::now()),
            started_at: rfc3339(self.started_at),
            process_identity: self.identity.clone(),
        };
        match self.store.write(&record).await {
            Ok(()) => {
                debug!(identity = %self.identity, at = %record.last_heartbeat_at, "heartbeat written");
                true
            }
            Err(err) => {
                metrics::counter!("mw_heartbeat_write_failures_total").increment(1);
                warn!(identity = %self.identity, error = %err, "heartbeat write failed; retrying next tick");
                false
            }
        }
    }

    /// Beat immediately, then every `period` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.publish_heartbeat().await;
                }
            }
        }
        debug!(identity = %self.identity, "heartbeat loop stopped");
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> TaskHandle {
        info!(
            identity = %self.identity,
            period_secs = self.period.as_secs_f64(),
            "starting heartbeat publisher"
        );
        spawn_supervised("liveness.heartbeat", move || {
            let publisher = self.clone();
            let cancel = cancel.clone();
            async move { publisher.run(cancel).await }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessStatus {
    pub online: bool,
    pub lag_ms: Option<i64>,
    pub stale_after_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_identity: Option<String>,
}

impl LivenessStatus {
    fn unknown(stale_after: Duration) -> Self {
        Self {
            online: false,
            lag_ms: None,
            stale_after_ms: duration_ms(stale_after),
            last_heartbeat_at: None,
            started_at: None,
            process_identity: None,
        }
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Derive status from an optional record. A heartbeat stamped in the future
/// (clock skew) counts as zero lag.
pub fn derive_status(
    record: Option<&HeartbeatRow>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> LivenessStatus {
    let Some(record) = record else {
        return LivenessStatus::unknown(stale_after);
    };
    let lag_ms = DateTime::parse_from_rfc3339(&record.last_heartbeat_at)
        .ok()
        .map(|at| (now - at.with_timezone(&Utc)).num_milliseconds().max(0));
    let stale_after_ms = duration_ms(stale_after);
    LivenessStatus {
        online: matches!(lag_ms, Some(lag) if lag <= stale_after_ms),
        lag_ms,
        stale_after_ms,
        last_heartbeat_at: Some(record.last_heartbeat_at.clone()),
        started_at: Some(record.started_at.clone()),
        process_identity: Some(record.process_identity.clone()),
    }
}

#[derive(Clone)]
pub struct LivenessReader {
    store: Arc<dyn LivenessStore>,
    stale_after: Duration,
}

impl LivenessReader {
    pub fn new(store: Arc<dyn LivenessStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub async fn status(&self) -> LivenessStatus {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> LivenessStatus {
        match self.store.read().await {
            Ok(record) => derive_status(record.as_ref(), now, self.stale_after),
            Err(err) => {
                warn!(error = %err, "liveness read failed");
                LivenessStatus::unknown(self.stale_after)
            }
        }
    }
}
