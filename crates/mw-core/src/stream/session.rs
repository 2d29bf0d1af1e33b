use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mw_events::{ChangeBus, ChangeEvent, Delivery, Subscription};
use mw_kernel::{Kernel, TaskFilter, TaskRow};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Frame, SessionFilter};
use crate::config::StreamConfig;
use crate::fingerprint::Fingerprint;
use crate::throttle::Throttle;

/// Authoritative source of filtered task snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, filter: &TaskFilter) -> anyhow::Result<Vec<TaskRow>>;
}

#[async_trait]
impl SnapshotSource for Kernel {
    async fn snapshot(&self, filter: &TaskFilter) -> anyhow::Result<Vec<TaskRow>> {
        self.list_tasks_async(filter).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub keepalive: Duration,
    pub retry: Duration,
    pub max_session: Option<Duration>,
}

impl SessionOptions {
    pub fn from_config(cfg: &StreamConfig) -> Self {
        Self {
            keepalive: cfg.keepalive(),
            retry: cfg.retry(),
            max_session: cfg.max_session(),
        }
    }
}

type SnapshotFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<TaskRow>>> + Send>>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One client's streaming session.
///
/// Sends the preamble and a baseline snapshot, then turns change
/// notifications into throttled, deduplicated snapshot pushes until the
/// client leaves, the token is cancelled or the bus goes away. Frames go to
/// `out`; the transport decides how to encode them.
pub struct StreamSession {
    id: u64,
    topic: String,
    filter: SessionFilter,
    options: SessionOptions,
    bus: Arc<dyn ChangeBus>,
    source: Arc<dyn SnapshotSource>,
    out: mpsc::Sender<Frame>,
    throttle: Throttle,
    last_fingerprint: Option<Fingerprint>,
    subscription: Option<Subscription>,
    in_flight: Option<SnapshotFuture>,
    state: SessionState,
}

impl StreamSession {
    pub fn new(
        topic: impl Into<String>,
        filter: SessionFilter,
        options: SessionOptions,
        bus: Arc<dyn ChangeBus>,
        source: Arc<dyn SnapshotSource>,
        out: mpsc::Sender<Frame>,
    ) -> Self {
        metrics::gauge!("mw_stream_sessions_active").increment(1.0);
        let throttle = Throttle::new(filter.min_interval);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            topic: topic.into(),
            filter,
            options,
            bus,
            source,
            out,
            throttle,
            last_fingerprint: None,
            subscription: None,
            in_flight: None,
            state: SessionState::Init,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(session = self.id, topic = %self.topic, filter = ?self.filter, "stream session opened");
        self.drive(&cancel).await;
        self.close();
    }

    /// Release the subscription and disarm the throttle. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.throttle.shutdown();
        self.in_flight = None;
        if let Some(sub) = self.subscription.take() {
            sub.unsubscribe();
        }
        metrics::gauge!("mw_stream_sessions_active").decrement(1.0);
        debug!(session = self.id, "stream session closed");
    }

    async fn drive(&mut self, cancel: &CancellationToken) {
        let preamble = Frame::Preamble {
            retry: self.options.retry,
        };
        if !emit(&self.out, preamble, cancel).await {
            return;
        }

        // Attach before the baseline query so changes committed while it
        // runs still wake the session.
        match self.bus.subscribe(&self.topic) {
            Ok(sub) => self.subscription = Some(sub),
            Err(err) => {
                warn!(session = self.id, error = %err, "stream subscribe failed");
                emit(&self.out, Frame::server_error(err.to_string()), cancel).await;
                return;
            }
        }

        let baseline = self.query();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = self.out.closed() => return,
            res = baseline => res,
        };
        match result {
            Ok(rows) => {
                let fingerprint = Fingerprint::of(&rows).ok();
                if !emit(&self.out, Frame::tasks(rows), cancel).await {
                    return;
                }
                self.last_fingerprint = fingerprint;
                self.throttle.record_push(Instant::now());
            }
            Err(err) => {
                warn!(session = self.id, error = %err, "baseline snapshot query failed");
                let frame = Frame::server_error(format!("snapshot query failed: {err}"));
                if !emit(&self.out, frame, cancel).await {
                    return;
                }
            }
        }

        let period = self.options.keepalive;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expires_at = self.options.max_session.map(|d| Instant::now() + d);
        self.state = SessionState::Active;

        loop {
            let deadline = self.throttle.deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session = self.id, "stream session cancelled");
                    break;
                }
                _ = self.out.closed() => {
                    debug!(session = self.id, "stream client disconnected");
                    break;
                }
                _ = sleep_until_opt(expires_at), if expires_at.is_some() => {
                    debug!(session = self.id, "stream session reached its lifetime cap");
                    break;
                }
                res = wait_snapshot(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    let Some(pushed) = self.finish_send(res, cancel).await else {
                        break;
                    };
                    if let Some(at) = self.throttle.complete(Instant::now(), pushed) {
                        trace!(session = self.id, due_in_ms = ms_until(at), "push re-armed");
                    }
                }
                delivery = next_delivery(&mut self.subscription) => match delivery {
                    Some(Delivery::Message(env)) => self.on_payload(&env.payload),
                    Some(Delivery::Lagged(missed)) => {
                        debug!(session = self.id, missed, "stream subscriber lagged; refreshing");
                        self.throttle.notify(Instant::now());
                    }
                    None => {
                        warn!(session = self.id, "change bus closed under stream session");
                        emit(&self.out, Frame::server_error("change bus closed"), cancel).await;
                        break;
                    }
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() && self.in_flight.is_none() => {
                    if self.throttle.on_timer_fire() {
                        self.in_flight = Some(self.query());
                    }
                }
                _ = keepalive.tick() => {
                    if !emit(&self.out, Frame::ping(), cancel).await {
                        break;
                    }
                }
            }
        }
    }

    fn on_payload(&mut self, payload: &str) {
        let Some(event) = ChangeEvent::decode(payload) else {
            trace!(session = self.id, "ignoring malformed change payload");
            return;
        };
        if !self.filter.accepts(&event) {
            trace!(session = self.id, task = ?event.task_id, "change outside session scope");
            return;
        }
        if let Some(at) = self.throttle.notify(Instant::now()) {
            trace!(session = self.id, due_in_ms = ms_until(at), "push scheduled");
        }
    }

    /// Emit the outcome of a snapshot query. `None` means the client is gone;
    /// otherwise whether a data frame went out.
    async fn finish_send(
        &mut self,
        result: anyhow::Result<Vec<TaskRow>>,
        cancel: &CancellationToken,
    ) -> Option<bool> {
        match result {
            Ok(rows) => {
                let fingerprint = Fingerprint::of(&rows).ok();
                if let Some(fp) = fingerprint.filter(|fp| Some(*fp) == self.last_fingerprint) {
                    trace!(session = self.id, rows = rows.len(), fingerprint = %fp, "snapshot unchanged; push suppressed");
                    return Some(false);
                }
                let rows_len = rows.len();
                if !emit(&self.out, Frame::tasks(rows), cancel).await {
                    return None;
                }
                if let Some(fp) = &fingerprint {
                    trace!(session = self.id, rows = rows_len, fingerprint = %fp, "snapshot pushed");
                }
                self.last_fingerprint = fingerprint;
                Some(true)
            }
            Err(err) => {
                warn!(session = self.id, error = %err, "snapshot query failed");
                let frame = Frame::server_error(format!("snapshot query failed: {err}"));
                if !emit(&self.out, frame, cancel).await {
                    return None;
                }
                Some(false)
            }
        }
    }

    fn query(&self) -> SnapshotFuture {
        let source = self.source.clone();
        let filter = self.filter.task_filter();
        Box::pin(async move { source.snapshot(&filter).await })
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn emit(out: &mpsc::Sender<Frame>, frame: Frame, cancel: &CancellationToken) -> bool {
    let kind = frame.kind();
    let sent = tokio::select! {
        res = out.send(frame) => res.is_ok(),
        _ = cancel.cancelled() => false,
    };
    if sent {
        metrics::counter!("mw_stream_frames_total", "kind" => kind).increment(1);
    }
    sent
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn wait_snapshot(slot: &mut Option<SnapshotFuture>) -> anyhow::Result<Vec<TaskRow>> {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_delivery(sub: &mut Option<Subscription>) -> Option<Delivery> {
    match sub.as_mut() {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

fn ms_until(at: Instant) -> u64 {
    at.saturating_duration_since(Instant::now()).as_millis() as u64
}
