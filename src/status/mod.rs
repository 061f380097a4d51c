//! Status derivation: merges hook/OTLP/exit signals into each session's
//! runtime status projection, guarded by a last-applied watermark.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::core::conversation::RuntimeStatus;
use crate::core::keyevent::{KeyEvent, StatusHint};
use crate::core::{AgentType, ExitStatus};
use crate::protocol::event::{EventScope, SessionEvent, StreamEventBody};
use crate::store::{StateStore, StoreError};

/// Codex SSE delta summaries retained as active-working hints but dropped
/// from fan-out unless verbose mode is enabled.
const VERBOSE_DELTA_MARKERS: &[&str] = &[
    "response.in_progress",
    "response.output_text.delta",
    "response.output_item.added",
    "response.function_call_arguments.delta",
];

/// Per-session status projection engine.
pub struct StatusDeriver {
    state: Arc<StateStore>,
    last_applied: DashMap<String, DateTime<Utc>>,
    last_key: DashMap<String, (String, DateTime<Utc>)>,
    last_known_work: DashMap<String, KeyEvent>,
    prompt_counters: DashMap<String, u32>,
    verbose: bool,
}

impl StatusDeriver {
    /// Build a deriver over the state store.
    #[must_use]
    pub fn new(state: Arc<StateStore>, verbose: bool) -> Self {
        Self {
            state,
            last_applied: DashMap::new(),
            last_key: DashMap::new(),
            last_known_work: DashMap::new(),
            prompt_counters: DashMap::new(),
            verbose,
        }
    }

    /// Whether an event is a verbose codex SSE delta.
    #[must_use]
    pub fn is_verbose_delta(event: &KeyEvent) -> bool {
        event.event_name == "codex.sse_event"
            && VERBOSE_DELTA_MARKERS
                .iter()
                .any(|m| event.summary.contains(m))
    }

    /// Last key event retained for a session, including verbose deltas.
    #[must_use]
    pub fn last_known_work(&self, session_id: &str) -> Option<KeyEvent> {
        self.last_known_work
            .get(session_id)
            .map(|e| e.value().clone())
    }

    /// Apply one normalized key event to a session.
    ///
    /// Duplicates (same name and timestamp as the previous event) are
    /// dropped. Events for unknown or archived conversations are inert.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn apply_key_event(
        &self,
        session_id: &str,
        event: KeyEvent,
    ) -> Result<(), StoreError> {
        let Ok(conversation) = self.state.conversation(session_id).await else {
            tracing::debug!(session_id, event = %event.event_name, "Dropping event for unknown session");
            return Ok(());
        };
        if conversation.is_archived() {
            return Ok(());
        }

        // Dedup on the (session, eventName, observedAt) triple.
        let key = event.dedup_key();
        if let Some(previous) = self.last_key.get(session_id) {
            if *previous.value() == key {
                return Ok(());
            }
        }
        self.last_key.insert(session_id.to_string(), key);

        if let Some(thread_id) = &event.provider_thread_id {
            if let Some(agent) = agent_of_event(&event.event_name) {
                self.state
                    .merge_provider_thread_id(session_id, agent, thread_id, event.observed_at)
                    .await?;
            }
        }

        self.last_known_work
            .insert(session_id.to_string(), event.clone());

        if Self::is_verbose_delta(&event) && !self.verbose {
            // Active-working hint only; no fan-out, no status change.
            return Ok(());
        }

        // Status first, then the key event itself: subscribers see
        // `session-status{running}` before the prompt event that caused it.
        if let Some(hint) = event.status_hint {
            let reason = match hint {
                StatusHint::NeedsInput => Some(event.summary.clone()),
                _ => None,
            };
            self.apply_hint(session_id, hint, event.observed_at, reason)
                .await?;
        }

        let scope = EventScope::conversation(
            conversation.scope.clone(),
            session_id,
            conversation.directory_id.as_deref(),
        );
        self.state
            .emit(
                scope,
                StreamEventBody::SessionKeyEvent {
                    session_id: session_id.to_string(),
                    key_event: event,
                },
            )
            .await;

        Ok(())
    }

    /// Apply a status hint directly (also used by `session.respond`).
    ///
    /// Out-of-order hints (older than the last applied timestamp) never
    /// regress the status; a session that has exited never leaves `exited`.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn apply_hint(
        &self,
        session_id: &str,
        hint: StatusHint,
        observed_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        let Ok(mut conversation) = self.state.conversation(session_id).await else {
            return Ok(());
        };
        if conversation.is_archived() || conversation.runtime_status == RuntimeStatus::Exited {
            return Ok(());
        }

        if let Some(last) = self.last_applied.get(session_id) {
            if observed_at < *last.value() {
                return Ok(());
            }
        }
        self.last_applied
            .insert(session_id.to_string(), observed_at);

        let next = match hint {
            StatusHint::Running => RuntimeStatus::Running,
            StatusHint::Completed => RuntimeStatus::Completed,
            StatusHint::NeedsInput => RuntimeStatus::NeedsInput,
        };

        conversation.runtime_last_event_at = Some(observed_at);
        let changed = conversation.runtime_status != next;
        conversation.runtime_status = next;
        conversation.attention_reason = match next {
            RuntimeStatus::NeedsInput => reason,
            _ => None,
        };
        self.state.persist_conversation(&conversation).await?;

        if changed {
            let scope = EventScope::conversation(
                conversation.scope.clone(),
                session_id,
                conversation.directory_id.as_deref(),
            );
            self.state
                .emit(
                    scope,
                    StreamEventBody::SessionStatus {
                        session_id: session_id.to_string(),
                        status: next,
                        attention_reason: conversation.attention_reason.clone(),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Record a child exit. Exit always wins over telemetry; only
    /// `session.remove` clears the runtime afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn apply_exit(&self, session_id: &str, exit: ExitStatus) -> Result<(), StoreError> {
        let Ok(mut conversation) = self.state.conversation(session_id).await else {
            return Ok(());
        };
        if conversation.is_archived() {
            return Ok(());
        }

        let now = Utc::now();
        self.last_applied.insert(session_id.to_string(), now);

        conversation.runtime_status = RuntimeStatus::Exited;
        conversation.runtime_last_exit = Some(exit.clone());
        conversation.runtime_process_id = None;
        conversation.runtime_live = false;
        conversation.attention_reason = None;
        self.state.persist_conversation(&conversation).await?;

        let scope = EventScope::conversation(
            conversation.scope.clone(),
            session_id,
            conversation.directory_id.as_deref(),
        );
        self.state
            .emit(
                scope.clone(),
                StreamEventBody::SessionEvent {
                    session_id: session_id.to_string(),
                    event: SessionEvent::SessionExit { exit },
                },
            )
            .await;
        self.state
            .emit(
                scope,
                StreamEventBody::SessionStatus {
                    session_id: session_id.to_string(),
                    status: RuntimeStatus::Exited,
                    attention_reason: None,
                },
            )
            .await;
        Ok(())
    }

    /// Emit a numbered `session-prompt-event` for an extracted prompt.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn apply_prompt(
        &self,
        session_id: &str,
        text: String,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Ok(conversation) = self.state.conversation(session_id).await else {
            return Ok(());
        };
        if conversation.is_archived() {
            return Ok(());
        }

        let index = {
            let mut counter = self
                .prompt_counters
                .entry(session_id.to_string())
                .or_insert(0);
            *counter += 1;
            *counter
        };

        let scope = EventScope::conversation(
            conversation.scope.clone(),
            session_id,
            conversation.directory_id.as_deref(),
        );
        self.state
            .emit(
                scope,
                StreamEventBody::SessionPromptEvent {
                    session_id: session_id.to_string(),
                    index,
                    text,
                    observed_at,
                },
            )
            .await;
        Ok(())
    }

    /// Forget per-session projection state (used by `session.remove`).
    pub fn forget_session(&self, session_id: &str) {
        self.last_applied.remove(session_id);
        self.last_key.remove(session_id);
        self.last_known_work.remove(session_id);
        self.prompt_counters.remove(session_id);
    }
}

fn agent_of_event(event_name: &str) -> Option<AgentType> {
    let prefix = event_name.split('.').next()?;
    match prefix {
        "codex" => Some(AgentType::Codex),
        "claude" => Some(AgentType::Claude),
        "cursor" => Some(AgentType::Cursor),
        _ => None,
    }
}
