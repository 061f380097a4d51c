//! Subscription router: filter-scoped fan-out with per-subscription cursors,
//! catch-up replay, and bounded-queue backpressure.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::scope::Scope;
use crate::protocol::event::{EventScope, StreamEventBody};
use crate::protocol::ServerFrame;

/// Queue depth at which a backpressure signal is recorded.
pub const QUEUE_HIGH_WATER: usize = 1024;

/// Queue depth at which a subscription is forcibly disconnected.
pub const QUEUE_DISCONNECT_LIMIT: usize = 4096;

/// How many events the in-memory ring retains for catch-up replay.
const RING_CAPACITY: usize = 8192;

/// An event paired with the scope fields used for filtering, stamped with
/// its global cursor.
#[derive(Debug, Clone)]
pub struct ScopedEvent {
    /// Globally monotonic cursor allocated at publish time.
    pub cursor: u64,

    /// Scope fields for subscription matching.
    pub scope: EventScope,

    /// The event body delivered to subscribers.
    pub body: StreamEventBody,
}

/// Filter set attached to a subscription. Unspecified fields match all.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Tenant scope the subscription is bound to.
    pub scope: Scope,

    /// Match only events for this repository.
    pub repository_id: Option<String>,

    /// Match only events for this task.
    pub task_id: Option<String>,

    /// Match only events for this directory.
    pub directory_id: Option<String>,

    /// Match only events for this conversation.
    pub conversation_id: Option<String>,
}

impl SubscriptionFilter {
    fn matches(&self, event: &EventScope) -> bool {
        if self.scope != event.scope {
            return false;
        }
        let field = |want: &Option<String>, have: &Option<String>| match want {
            Some(id) => have.as_deref() == Some(id.as_str()),
            None => true,
        };
        field(&self.repository_id, &event.repository_id)
            && field(&self.task_id, &event.task_id)
            && field(&self.directory_id, &event.directory_id)
            && field(&self.conversation_id, &event.conversation_id)
    }
}

struct SubscriptionEntry {
    filter: SubscriptionFilter,
    include_output: bool,
    tx: mpsc::Sender<ServerFrame>,
}

/// Fan-out counters. All monotonic.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Events enqueued across all subscriptions.
    pub fanout_events_enqueued_total: AtomicU64,

    /// Backpressure signals (queue above high-water at enqueue time).
    pub fanout_backpressure_signals_total: AtomicU64,

    /// Subscriptions disconnected for exceeding the queue limit.
    pub fanout_backpressure_disconnects_total: AtomicU64,

    /// Output cursor regressions observed (tolerated, but anomalous).
    pub output_cursor_regressions_total: AtomicU64,
}

struct RouterInner {
    subscriptions: HashMap<Uuid, SubscriptionEntry>,
    ring: VecDeque<ScopedEvent>,
    taps: Vec<mpsc::UnboundedSender<ScopedEvent>>,
}

/// The fan-out router. One per daemon.
pub struct SubscriptionRouter {
    inner: Mutex<RouterInner>,
    cursor: AtomicU64,
    metrics: RouterMetrics,
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                subscriptions: HashMap::new(),
                ring: VecDeque::new(),
                taps: Vec::new(),
            }),
            cursor: AtomicU64::new(0),
            metrics: RouterMetrics::default(),
        }
    }

    /// Current watermark: the cursor of the most recently published event.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Fan-out counters.
    #[must_use]
    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Register an internal observer receiving every published event
    /// regardless of filters (used by the lifecycle bridge and title namer).
    pub fn register_tap(&self) -> mpsc::UnboundedReceiver<ScopedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("router lock poisoned")
            .taps
            .push(tx);
        rx
    }

    /// Register a subscription bound to a connection's forwarding channel.
    ///
    /// Returns `(subscription_id, watermark)`. When `after_cursor` is set,
    /// retained events with `cursor > after_cursor` matching the filter are
    /// replayed into the queue before any live event.
    pub fn subscribe(
        &self,
        filter: SubscriptionFilter,
        include_output: bool,
        after_cursor: Option<u64>,
    ) -> (Uuid, u64, mpsc::Receiver<ServerFrame>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(QUEUE_DISCONNECT_LIMIT);

        let mut inner = self.inner.lock().expect("router lock poisoned");
        if let Some(after) = after_cursor {
            for event in inner.ring.iter().filter(|e| e.cursor > after) {
                if !filter.matches(&event.scope) {
                    continue;
                }
                if event.body.is_output() && !include_output {
                    continue;
                }
                let frame = ServerFrame::StreamEvent {
                    subscription_id: format!("subscription-{id}"),
                    cursor: event.cursor,
                    event: event.body.clone(),
                };
                if tx.try_send(frame).is_err() {
                    break;
                }
                self.metrics
                    .fanout_events_enqueued_total
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.subscriptions.insert(
            id,
            SubscriptionEntry {
                filter,
                include_output,
                tx,
            },
        );
        drop(inner);

        (id, self.watermark(), rx)
    }

    /// Drop a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.inner
            .lock()
            .expect("router lock poisoned")
            .subscriptions
            .remove(&id)
            .is_some()
    }

    /// Allocate the next global cursor and fan the event out to every
    /// matching subscription. Returns the allocated cursor.
    ///
    /// Never blocks: a subscription whose queue is full is disconnected
    /// rather than stalling the publisher or its sibling subscriptions.
    pub fn publish(&self, scope: EventScope, body: StreamEventBody) -> u64 {
        let cursor = self.cursor.fetch_add(1, Ordering::SeqCst) + 1;
        let event = ScopedEvent {
            cursor,
            scope,
            body,
        };

        let mut inner = self.inner.lock().expect("router lock poisoned");

        inner.ring.push_back(event.clone());
        while inner.ring.len() > RING_CAPACITY {
            inner.ring.pop_front();
        }

        inner.taps.retain(|tap| tap.send(event.clone()).is_ok());

        let mut disconnected = Vec::new();
        for (id, entry) in &inner.subscriptions {
            if !entry.filter.matches(&event.scope) {
                continue;
            }
            if event.body.is_output() && !entry.include_output {
                continue;
            }
            let frame = ServerFrame::StreamEvent {
                subscription_id: format!("subscription-{id}"),
                cursor,
                event: event.body.clone(),
            };
            match entry.tx.try_send(frame) {
                Ok(()) => {
                    self.metrics
                        .fanout_events_enqueued_total
                        .fetch_add(1, Ordering::Relaxed);
                    let queued = QUEUE_DISCONNECT_LIMIT - entry.tx.capacity();
                    if queued >= QUEUE_HIGH_WATER {
                        self.metrics
                            .fanout_backpressure_signals_total
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscription_id = %id,
                        "Subscription queue exceeded limit; disconnecting subscriber"
                    );
                    self.metrics
                        .fanout_backpressure_disconnects_total
                        .fetch_add(1, Ordering::Relaxed);
                    disconnected.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    disconnected.push(*id);
                }
            }
        }
        for id in disconnected {
            inner.subscriptions.remove(&id);
        }
        drop(inner);

        cursor
    }

    /// Record an anomalous output cursor regression.
    pub fn record_cursor_regression(&self) {
        self.metrics
            .output_cursor_regressions_total
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RuntimeStatus;

    fn scope() -> Scope {
        Scope {
            tenant_id: "t".into(),
            user_id: "u".into(),
            workspace_id: "w".into(),
        }
    }

    fn status_event(conversation_id: &str) -> (EventScope, StreamEventBody) {
        (
            EventScope::conversation(scope(), conversation_id, None),
            StreamEventBody::SessionStatus {
                session_id: conversation_id.into(),
                status: RuntimeStatus::Running,
                attention_reason: None,
            },
        )
    }

    fn output_event(conversation_id: &str, cursor: u64) -> (EventScope, StreamEventBody) {
        (
            EventScope::conversation(scope(), conversation_id, None),
            StreamEventBody::SessionOutput {
                session_id: conversation_id.into(),
                cursor,
                chunk_base64: "aGk=".into(),
            },
        )
    }

    #[test]
    fn test_cursors_strictly_increase() {
        let router = SubscriptionRouter::new();
        let filter = SubscriptionFilter {
            scope: scope(),
            ..SubscriptionFilter::default()
        };
        let (_, watermark, mut rx) = router.subscribe(filter, false, None);
        assert_eq!(watermark, 0);

        let (s, b) = status_event("conversation-1");
        let c1 = router.publish(s, b);
        let (s, b) = status_event("conversation-1");
        let c2 = router.publish(s, b);
        assert!(c2 > c1);

        let mut last = 0;
        while let Ok(frame) = rx.try_recv() {
            if let ServerFrame::StreamEvent { cursor, .. } = frame {
                assert!(cursor > last);
                last = cursor;
            }
        }
        assert_eq!(last, c2);
    }

    #[test]
    fn test_conversation_filter_precision() {
        let router = SubscriptionRouter::new();
        let local = SubscriptionFilter {
            scope: scope(),
            conversation_id: Some("conversation-local".into()),
            ..SubscriptionFilter::default()
        };
        let other = SubscriptionFilter {
            scope: scope(),
            conversation_id: Some("conversation-other".into()),
            ..SubscriptionFilter::default()
        };
        let (_, _, mut local_rx) = router.subscribe(local, true, None);
        let (_, _, mut other_rx) = router.subscribe(other, true, None);

        let (s, b) = output_event("conversation-local", 1);
        router.publish(s, b);

        assert!(local_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_output_requires_include_output() {
        let router = SubscriptionRouter::new();
        let filter = SubscriptionFilter {
            scope: scope(),
            ..SubscriptionFilter::default()
        };
        let (_, _, mut rx) = router.subscribe(filter, false, None);

        let (s, b) = output_event("conversation-1", 1);
        router.publish(s, b);
        assert!(rx.try_recv().is_err());

        let (s, b) = status_event("conversation-1");
        router.publish(s, b);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_replay_after_cursor() {
        let router = SubscriptionRouter::new();
        let (s, b) = status_event("conversation-1");
        let c1 = router.publish(s, b);
        let (s, b) = status_event("conversation-1");
        let c2 = router.publish(s, b);

        let filter = SubscriptionFilter {
            scope: scope(),
            ..SubscriptionFilter::default()
        };
        let (_, watermark, mut rx) = router.subscribe(filter, false, Some(c1));
        assert_eq!(watermark, c2);

        let frame = rx.try_recv().unwrap();
        match frame {
            ServerFrame::StreamEvent { cursor, .. } => assert_eq!(cursor, c2),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_scope_mismatch_never_delivered() {
        let router = SubscriptionRouter::new();
        let foreign = SubscriptionFilter {
            scope: Scope {
                tenant_id: "someone-else".into(),
                user_id: "u".into(),
                workspace_id: "w".into(),
            },
            ..SubscriptionFilter::default()
        };
        let (_, _, mut rx) = router.subscribe(foreign, true, None);

        let (s, b) = status_event("conversation-1");
        router.publish(s, b);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_backpressure_disconnects_full_subscription() {
        let router = SubscriptionRouter::new();
        let filter = SubscriptionFilter {
            scope: scope(),
            ..SubscriptionFilter::default()
        };
        // Keep rx alive but never drain it.
        let (_, _, _rx) = router.subscribe(filter, false, None);

        for _ in 0..=QUEUE_DISCONNECT_LIMIT {
            let (s, b) = status_event("conversation-1");
            router.publish(s, b);
        }

        assert!(
            router
                .metrics()
                .fanout_backpressure_disconnects_total
                .load(Ordering::Relaxed)
                >= 1
        );
        assert!(
            router
                .metrics()
                .fanout_backpressure_signals_total
                .load(Ordering::Relaxed)
                >= 1
        );
        // Subsequent publishes fan out to nobody without error.
        let (s, b) = status_event("conversation-1");
        router.publish(s, b);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let router = SubscriptionRouter::new();
        let filter = SubscriptionFilter {
            scope: scope(),
            ..SubscriptionFilter::default()
        };
        let (id, _, mut rx) = router.subscribe(filter, false, None);
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));

        let (s, b) = status_event("conversation-1");
        router.publish(s, b);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected) | Err(mpsc::error::TryRecvError::Empty)
        ));
    }
}
