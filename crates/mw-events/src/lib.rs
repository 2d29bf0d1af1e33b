use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

mod change;

pub use change::ChangeEvent;

/// Minimal message envelope (RFC3339 time). The payload stays raw JSON text so
/// subscribers decide how much of it to decode.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub time: String,
    pub topic: Arc<str>,
    pub payload: Arc<str>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("change bus is closed")]
    Closed,
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to `{topic}` failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// Publish/subscribe contract every broker backend satisfies.
///
/// `publish` must never block on slow subscribers; `subscribe` hands back a
/// [`Subscription`] that detaches from the topic when dropped.
pub trait ChangeBus: Send + Sync {
    /// Publish `payload` to every current subscriber of `topic`; returns how
    /// many subscribers were attached at send time.
    fn publish(&self, topic: &str, payload: &str) -> Result<usize, BusError>;

    fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

/// What a subscriber observes on its next receive.
#[derive(Debug)]
pub enum Delivery {
    Message(Envelope),
    /// The subscriber fell behind and `n` messages were dropped for it.
    Lagged(u64),
}

/// Live attachment to a single topic.
pub struct Subscription {
    topic: Arc<str>,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    pub fn new(topic: impl Into<Arc<str>>, rx: broadcast::Receiver<Envelope>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// Wait for the next delivery. `None` means the bus went away.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.rx.recv().await {
            Ok(env) => Some(Delivery::Message(env)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Detach from the topic. Dropping the subscription has the same effect.
    pub fn unsubscribe(self) {
        tracing::trace!(topic = %self.topic, "bus subscription released");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

/// In-process broker: one bounded broadcast ring per topic.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
    closed: AtomicBool,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Shut the broker down; subscribers drain what is buffered and then see
    /// the end of their stream, later publishes and subscribes fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.topics.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeBus for LocalBus {
    fn publish(&self, topic: &str, payload: &str) -> Result<usize, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let tx = match self.inner.topics.lock().get(topic) {
            Some(tx) => tx.clone(),
            None => return Ok(0),
        };
        let env = Envelope {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            topic: Arc::from(topic),
            payload: Arc::from(payload),
        };
        // A send error only means nobody is listening right now.
        Ok(tx.send(env).unwrap_or(0))
    }

    fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let rx = {
            let mut topics = self.inner.topics.lock();
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        tracing::trace!(topic, "bus subscription attached");
        Ok(Subscription::new(topic, rx))
    }
}
