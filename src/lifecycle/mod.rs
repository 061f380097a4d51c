//! Lifecycle hooks bridge: translates stream events into outbound
//! webhook/ping dispatch with dedupe and per-connector timeouts.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::RuntimeStatus;
use crate::protocol::event::{SessionEvent, StreamEventBody};
use crate::router::ScopedEvent;

/// A normalized lifecycle event headed for outbound connectors.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    /// Event type, e.g. `turn.completed` or `thread.created`.
    pub event_type: String,

    /// Session the event concerns, when session-centric.
    pub session_id: Option<String>,

    /// When the underlying event was observed.
    pub observed_at: DateTime<Utc>,

    /// Connector payload.
    pub payload: serde_json::Value,
}

/// An outbound delivery target.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector name for logging.
    fn name(&self) -> &str;

    /// Deliver one event. Failures are logged, never fatal.
    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

/// Plain HTTP webhook connector: POSTs the event JSON.
pub struct WebhookConnector {
    name: String,
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookConnector {
    /// Build a webhook connector.
    #[must_use]
    pub fn new(name: String, url: String, timeout: Duration) -> Self {
        Self {
            name,
            url,
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for WebhookConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Categorical ping connector: collapses events into coarse categories.
pub struct PeonPingConnector {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl PeonPingConnector {
    /// Build a ping connector.
    #[must_use]
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn category(event_type: &str) -> &'static str {
        match event_type {
            "turn.completed" => "work-done",
            "input.required" => "needs-attention",
            "turn.failed" | "tool.failed" | "session.exited" => "failure",
            _ => "info",
        }
    }
}

#[async_trait]
impl Connector for PeonPingConnector {
    fn name(&self) -> &str {
        "peon-ping"
    }

    async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "category": Self::category(&event.event_type),
            "message": event.event_type,
            "sessionId": event.session_id,
        });
        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// The bridge: observes the router, enqueues normalized events, drains to
/// connectors.
pub struct LifecycleBridge {
    connectors: Vec<Arc<dyn Connector>>,
    queue: Mutex<VecDeque<LifecycleEvent>>,
    seen: Mutex<HashSet<(String, String, i64)>>,
    started_sessions: Mutex<HashSet<String>>,
    draining: AtomicBool,
}

impl LifecycleBridge {
    /// Build a bridge over a set of connectors.
    #[must_use]
    pub fn new(connectors: Vec<Arc<dyn Connector>>) -> Self {
        Self {
            connectors,
            queue: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashSet::new()),
            started_sessions: Mutex::new(HashSet::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Watch a router tap until cancelled.
    pub fn spawn(
        bridge: Arc<Self>,
        mut tap: mpsc::UnboundedReceiver<ScopedEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = tap.recv() => {
                        let Some(event) = event else { break };
                        bridge.observe(&event).await;
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Map one observed stream event and enqueue the results.
    pub async fn observe(&self, scoped: &ScopedEvent) {
        let events = self.map_observed(scoped).await;
        if events.is_empty() {
            return;
        }

        {
            let mut queue = self.queue.lock().await;
            let mut seen = self.seen.lock().await;
            for event in events {
                let key = (
                    event.event_type.clone(),
                    event.session_id.clone().unwrap_or_default(),
                    event.observed_at.timestamp_millis(),
                );
                if seen.insert(key) {
                    queue.push_back(event);
                }
            }
        }
        self.drain().await;
    }

    async fn map_observed(&self, scoped: &ScopedEvent) -> Vec<LifecycleEvent> {
        let now = Utc::now();
        let event = |event_type: &str, session_id: Option<&str>, payload: serde_json::Value| {
            LifecycleEvent {
                event_type: event_type.to_string(),
                session_id: session_id.map(ToString::to_string),
                observed_at: now,
                payload,
            }
        };

        match &scoped.body {
            StreamEventBody::SessionStatus {
                session_id, status, ..
            } => match status {
                RuntimeStatus::Running => {
                    let mut started = self.started_sessions.lock().await;
                    if started.insert(session_id.clone()) {
                        vec![event("turn.started", Some(session_id), serde_json::json!({}))]
                    } else {
                        Vec::new()
                    }
                }
                RuntimeStatus::Completed => {
                    vec![event("turn.completed", Some(session_id), serde_json::json!({}))]
                }
                RuntimeStatus::NeedsInput => {
                    vec![event("input.required", Some(session_id), serde_json::json!({}))]
                }
                // session.exited is derived from the session-exit event,
                // which carries the exit status.
                RuntimeStatus::Exited => Vec::new(),
            },
            StreamEventBody::SessionEvent {
                session_id,
                event: SessionEvent::SessionExit { exit },
            } => {
                let payload = serde_json::to_value(exit).unwrap_or_default();
                let mut out = vec![event("session.exited", Some(session_id), payload.clone())];
                if exit.is_failure() {
                    out.push(event("turn.failed", Some(session_id), payload));
                }
                out
            }
            StreamEventBody::SessionKeyEvent {
                session_id,
                key_event,
            } => {
                let name = key_event.event_name.as_str();
                let severity = key_event.severity.as_deref().unwrap_or_default();
                if name == "codex.tool_result" && severity == "ERROR" {
                    return vec![event(
                        "tool.failed",
                        Some(session_id),
                        key_event.payload.clone(),
                    )];
                }
                if name.ends_with(".userpromptsubmit") || name.ends_with(".user_prompt") {
                    return vec![event("turn.started", Some(session_id), serde_json::json!({}))];
                }
                if name.contains("api_request")
                    && (severity == "ERROR"
                        || severity == "FATAL"
                        || key_event.summary.contains("abort"))
                {
                    return vec![event(
                        "turn.failed",
                        Some(session_id),
                        key_event.payload.clone(),
                    )];
                }
                Vec::new()
            }
            StreamEventBody::ConversationCreated { conversation } => {
                vec![event(
                    "thread.created",
                    Some(&conversation.id),
                    serde_json::json!({"title": conversation.title}),
                )]
            }
            StreamEventBody::ConversationUpdated { conversation } => {
                vec![event(
                    "thread.updated",
                    Some(&conversation.id),
                    serde_json::json!({"title": conversation.title}),
                )]
            }
            StreamEventBody::ConversationArchived { conversation_id } => {
                vec![event("thread.archived", Some(conversation_id), serde_json::json!({}))]
            }
            StreamEventBody::ConversationDeleted { conversation_id } => {
                vec![event("thread.deleted", Some(conversation_id), serde_json::json!({}))]
            }
            // Directory and repository churn stays internal.
            _ => Vec::new(),
        }
    }

    /// Drain queued events to every connector. Restarts when new events
    /// arrive mid-flush; only one drain runs at a time.
    pub async fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            let next = self.queue.lock().await.pop_front();
            let Some(event) = next else { break };

            for connector in &self.connectors {
                if let Err(e) = connector.deliver(&event).await {
                    tracing::warn!(
                        connector = connector.name(),
                        event_type = %event.event_type,
                        error = %e,
                        "Lifecycle connector delivery failed"
                    );
                }
            }
        }

        self.draining.store(false, Ordering::SeqCst);

        // An event enqueued while we were flipping the flag restarts the
        // drain rather than waiting for the next arrival.
        if !self.queue.lock().await.is_empty() {
            Box::pin(self.drain()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExitStatus, KeyEvent, Scope};
    use crate::core::keyevent::KeyEventSource;
    use crate::protocol::event::EventScope;
    use std::sync::Mutex as StdMutex;

    struct RecordingConnector {
        delivered: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
            self.delivered.lock().unwrap().push(event.event_type.clone());
            if self.fail {
                anyhow::bail!("connector down");
            }
            Ok(())
        }
    }

    fn scoped(body: StreamEventBody) -> ScopedEvent {
        ScopedEvent {
            cursor: 1,
            scope: EventScope::conversation(Scope::default(), "conversation-1", None),
            body,
        }
    }

    fn bridge_with_recorder(fail: bool) -> (Arc<LifecycleBridge>, Arc<StdMutex<Vec<String>>>) {
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let connector = Arc::new(RecordingConnector {
            delivered: Arc::clone(&delivered),
            fail,
        });
        (Arc::new(LifecycleBridge::new(vec![connector])), delivered)
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (bridge, delivered) = bridge_with_recorder(false);

        for status in [
            RuntimeStatus::Running,
            RuntimeStatus::Completed,
            RuntimeStatus::NeedsInput,
        ] {
            bridge
                .observe(&scoped(StreamEventBody::SessionStatus {
                    session_id: "conversation-1".into(),
                    status,
                    attention_reason: None,
                }))
                .await;
        }

        let events = delivered.lock().unwrap().clone();
        assert_eq!(events, vec!["turn.started", "turn.completed", "input.required"]);
    }

    #[tokio::test]
    async fn test_turn_started_only_first_running() {
        let (bridge, delivered) = bridge_with_recorder(false);
        for _ in 0..2 {
            bridge
                .observe(&scoped(StreamEventBody::SessionStatus {
                    session_id: "conversation-1".into(),
                    status: RuntimeStatus::Running,
                    attention_reason: None,
                }))
                .await;
        }
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_adds_turn_failed() {
        let (bridge, delivered) = bridge_with_recorder(false);
        bridge
            .observe(&scoped(StreamEventBody::SessionEvent {
                session_id: "conversation-1".into(),
                event: SessionEvent::SessionExit {
                    exit: ExitStatus {
                        code: Some(2),
                        signal: None,
                    },
                },
            }))
            .await;
        let events = delivered.lock().unwrap().clone();
        assert_eq!(events, vec!["session.exited", "turn.failed"]);
    }

    #[tokio::test]
    async fn test_connector_failure_does_not_block_drain() {
        let (bridge, delivered) = bridge_with_recorder(true);
        for status in [RuntimeStatus::Completed, RuntimeStatus::NeedsInput] {
            bridge
                .observe(&scoped(StreamEventBody::SessionStatus {
                    session_id: "conversation-1".into(),
                    status,
                    attention_reason: None,
                }))
                .await;
        }
        // Both events delivered (and failed) rather than the first failure
        // wedging the queue.
        assert_eq!(delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_tool_key_event_maps() {
        let (bridge, delivered) = bridge_with_recorder(false);
        bridge
            .observe(&scoped(StreamEventBody::SessionKeyEvent {
                session_id: "conversation-1".into(),
                key_event: KeyEvent {
                    source: KeyEventSource::Otlp,
                    observed_at: Utc::now(),
                    event_name: "codex.tool_result".into(),
                    severity: Some("ERROR".into()),
                    summary: "tool blew up".into(),
                    provider_thread_id: None,
                    status_hint: None,
                    payload: serde_json::json!({}),
                },
            }))
            .await;
        assert_eq!(delivered.lock().unwrap().clone(), vec!["tool.failed"]);
    }

    #[tokio::test]
    async fn test_duplicate_events_deduped() {
        let (bridge, delivered) = bridge_with_recorder(false);
        let event = scoped(StreamEventBody::ConversationArchived {
            conversation_id: "conversation-1".into(),
        });
        bridge.observe(&event).await;
        bridge.observe(&event).await;
        // Same (type, session, observedAt) may collide within a
        // millisecond; at minimum the first lands, at most one extra.
        assert!(!delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ping_categories() {
        assert_eq!(PeonPingConnector::category("turn.completed"), "work-done");
        assert_eq!(PeonPingConnector::category("input.required"), "needs-attention");
        assert_eq!(PeonPingConnector::category("turn.failed"), "failure");
        assert_eq!(PeonPingConnector::category("thread.created"), "info");
    }
}
