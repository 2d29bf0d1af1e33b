use std::sync::Arc;
use std::time::Duration;

use mw_events::{ChangeBus, ChangeEvent};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{trace, warn};

/// What happened to a single announcement. Callers are free to ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Handed to the bus; `receivers` subscribers were attached at send time.
    Delivered { receivers: usize },
    /// The bus refused the publish. `reported` is whether a warning was logged
    /// for it or it fell inside the cooldown window.
    Failed { reported: bool },
}

/// Best-effort change announcer used by everything that mutates task state.
///
/// Publishing never fails to the caller. Failure warnings are rate limited to
/// one per `cooldown` using the last-warning instant held by this instance.
pub struct Announcer {
    bus: Arc<dyn ChangeBus>,
    cooldown: Duration,
    last_error: Mutex<Option<Instant>>,
}

impl Announcer {
    pub fn new(bus: Arc<dyn ChangeBus>, cooldown: Duration) -> Self {
        Self {
            bus,
            cooldown,
            last_error: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<dyn ChangeBus> {
        &self.bus
    }

    pub fn announce(&self, topic: &str, event: &ChangeEvent) -> AnnounceOutcome {
        self.announce_at(topic, event, Instant::now())
    }

    pub fn announce_at(&self, topic: &str, event: &ChangeEvent, now: Instant) -> AnnounceOutcome {
        let payload = event.encode();
        match self.bus.publish(topic, &payload) {
            Ok(receivers) => {
                trace!(topic, receivers, task = ?event.task_id, "change announced");
                AnnounceOutcome::Delivered { receivers }
            }
            Err(err) => {
                metrics::counter!("mw_notify_publish_failures_total").increment(1);
                let reported = self.should_report(now);
                if reported {
                    warn!(topic, error = %err, "change announcement failed");
                }
                AnnounceOutcome::Failed { reported }
            }
        }
    }

    fn should_report(&self, now: Instant) -> bool {
        let mut last = self.last_error.lock();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.cooldown => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl std::fmt::Debug for Announcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announcer")
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mw_events::{BusError, Delivery, LocalBus, Subscription};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenBus {
        attempts: AtomicUsize,
    }

    impl ChangeBus for BrokenBus {
        fn publish(&self, topic: &str, _payload: &str) -> Result<usize, BusError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "broker unreachable".into(),
            })
        }

        fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
            Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: "broker unreachable".into(),
            })
        }
    }

    #[tokio::test]
    async fn delivers_compact_payload_to_subscribers() {
        let bus = LocalBus::new(8);
        let mut sub = bus.subscribe("tasks.changed").unwrap();
        let announcer = Announcer::new(Arc::new(bus.clone()), Duration::from_secs(10));

        let ev = ChangeEvent::for_task("t1").with_status("running");
        let out = announcer.announce("tasks.changed", &ev);
        assert_eq!(out, AnnounceOutcome::Delivered { receivers: 1 });

        match sub.recv().await {
            Some(Delivery::Message(env)) => {
                let got = ChangeEvent::decode(&env.payload).unwrap();
                assert_eq!(got.task_id.as_deref(), Some("t1"));
                assert_eq!(got.status.as_deref(), Some("running"));
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[test]
    fn no_subscribers_is_not_a_failure() {
        let announcer = Announcer::new(Arc::new(LocalBus::new(8)), Duration::from_secs(10));
        let out = announcer.announce("tasks.changed", &ChangeEvent::for_task("t1"));
        assert_eq!(out, AnnounceOutcome::Delivered { receivers: 0 });
    }

    #[test]
    fn failures_are_reported_once_per_cooldown() {
        let bus = Arc::new(BrokenBus {
            attempts: AtomicUsize::new(0),
        });
        let announcer = Announcer::new(bus.clone(), Duration::from_secs(10));
        let ev = ChangeEvent::for_task("t1");
        let t0 = Instant::now();

        assert_eq!(
            announcer.announce_at("tasks.changed", &ev, t0),
            AnnounceOutcome::Failed { reported: true }
        );
        for ms in [1, 500, 9_999] {
            assert_eq!(
                announcer.announce_at("tasks.changed", &ev, t0 + Duration::from_millis(ms)),
                AnnounceOutcome::Failed { reported: false }
            );
        }
        assert_eq!(
            announcer.announce_at("tasks.changed", &ev, t0 + Duration::from_secs(10)),
            AnnounceOutcome::Failed { reported: true }
        );
        // Every call still attempted the publish; only the logging is throttled.
        assert_eq!(bus.attempts.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn cooldown_state_is_per_instance() {
        let bus: Arc<dyn ChangeBus> = Arc::new(BrokenBus {
            attempts: AtomicUsize::new(0),
        });
        let a = Announcer::new(bus.clone(), Duration::from_secs(10));
        let b = Announcer::new(bus, Duration::from_secs(10));
        let ev = ChangeEvent::for_task("t1");
        let t0 = Instant::now();
        assert_eq!(
            a.announce_at("x", &ev, t0),
            AnnounceOutcome::Failed { reported: true }
        );
        assert_eq!(
            b.announce_at("x", &ev, t0),
            AnnounceOutcome::Failed { reported: true }
        );
    }
}
