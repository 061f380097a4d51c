use serde::{Deserialize, Serialize};

use crate::core::conversation::{Controller, Conversation, ExitStatus, RuntimeStatus};
use crate::core::directory::Directory;
use crate::core::keyevent::KeyEvent;
use crate::core::repository::Repository;
use crate::core::scope::Scope;
use crate::core::task::Task;

/// Scope fields attached to every fan-out event for subscription matching.
///
/// Tenant/user/workspace always match exactly; the entity ids match when the
/// subscription specifies them and are wildcards otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    /// Owning tenant/user/workspace.
    #[serde(flatten)]
    pub scope: Scope,

    /// Repository the event concerns, if any.
    pub repository_id: Option<String>,

    /// Task the event concerns, if any.
    pub task_id: Option<String>,

    /// Directory the event concerns, if any.
    pub directory_id: Option<String>,

    /// Conversation the event concerns, if any.
    pub conversation_id: Option<String>,
}

impl EventScope {
    /// Scope for a conversation-centric event.
    #[must_use]
    pub fn conversation(scope: Scope, conversation_id: &str, directory_id: Option<&str>) -> Self {
        Self {
            scope,
            conversation_id: Some(conversation_id.to_string()),
            directory_id: directory_id.map(ToString::to_string),
            ..Self::default()
        }
    }

    /// Scope for a task-centric event.
    #[must_use]
    pub fn task(scope: Scope, task: &Task) -> Self {
        Self {
            scope,
            task_id: Some(task.id.clone()),
            repository_id: task.repository_id.clone(),
            directory_id: task.project_id.clone(),
            ..Self::default()
        }
    }

    /// Scope for a directory-centric event.
    #[must_use]
    pub fn directory(scope: Scope, directory_id: &str) -> Self {
        Self {
            scope,
            directory_id: Some(directory_id.to_string()),
            ..Self::default()
        }
    }

    /// Scope for a repository-centric event.
    #[must_use]
    pub fn repository(scope: Scope, repository_id: &str) -> Self {
        Self {
            scope,
            repository_id: Some(repository_id.to_string()),
            ..Self::default()
        }
    }
}

/// Typed session events carried by `pty.event` envelopes and the
/// `session-event` fan-out variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    /// The child process terminated.
    #[serde(rename = "session-exit")]
    SessionExit {
        /// Exit outcome.
        exit: ExitStatus,
    },

    /// An adapter notify record was observed for the session.
    #[serde(rename = "notify")]
    Notify {
        /// The raw notify record.
        record: serde_json::Value,
    },
}

/// Fan-out event bodies carried by `stream.event` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEventBody {
    /// A session's derived runtime status changed.
    #[serde(rename = "session-status", rename_all = "camelCase")]
    SessionStatus {
        /// Source session.
        session_id: String,
        /// New status.
        status: RuntimeStatus,
        /// Attention reason for needs-input.
        #[serde(skip_serializing_if = "Option::is_none")]
        attention_reason: Option<String>,
    },

    /// A session's controller lease changed.
    #[serde(rename = "session-control", rename_all = "camelCase")]
    SessionControl {
        /// Source session.
        session_id: String,
        /// New controller; `None` after release.
        controller: Option<Controller>,
    },

    /// A normalized telemetry/hook key event.
    #[serde(rename = "session-key-event", rename_all = "camelCase")]
    SessionKeyEvent {
        /// Source session.
        session_id: String,
        /// The key event.
        key_event: KeyEvent,
    },

    /// A user prompt extracted from telemetry or hooks.
    #[serde(rename = "session-prompt-event", rename_all = "camelCase")]
    SessionPromptEvent {
        /// Source session.
        session_id: String,
        /// 1-based chronological prompt number within the thread.
        index: u32,
        /// Prompt text with image attachments stripped.
        text: String,
        /// Provider-side observation timestamp.
        observed_at: chrono::DateTime<chrono::Utc>,
    },

    /// A PTY output chunk. Delivered only to `includeOutput` subscriptions.
    #[serde(rename = "session-output", rename_all = "camelCase")]
    SessionOutput {
        /// Source session.
        session_id: String,
        /// Per-session monotonic chunk position.
        cursor: u64,
        /// Base64-encoded bytes.
        chunk_base64: String,
    },

    /// A typed session event (exit, notify).
    #[serde(rename = "session-event", rename_all = "camelCase")]
    SessionEvent {
        /// Source session.
        session_id: String,
        /// The event.
        event: SessionEvent,
    },

    /// A session runtime was removed from the supervisor.
    #[serde(rename = "session-removed", rename_all = "camelCase")]
    SessionRemoved {
        /// Removed session.
        session_id: String,
    },

    /// A thread was created.
    #[serde(rename = "conversation-created", rename_all = "camelCase")]
    ConversationCreated {
        /// The new thread.
        conversation: Conversation,
    },

    /// A thread was updated.
    #[serde(rename = "conversation-updated", rename_all = "camelCase")]
    ConversationUpdated {
        /// The updated thread.
        conversation: Conversation,
    },

    /// A thread was archived.
    #[serde(rename = "conversation-archived", rename_all = "camelCase")]
    ConversationArchived {
        /// Archived thread id.
        conversation_id: String,
    },

    /// A thread was deleted.
    #[serde(rename = "conversation-deleted", rename_all = "camelCase")]
    ConversationDeleted {
        /// Deleted thread id.
        conversation_id: String,
    },

    /// A directory was created or updated.
    #[serde(rename = "directory-updated", rename_all = "camelCase")]
    DirectoryUpdated {
        /// The directory.
        directory: Directory,
    },

    /// A directory was archived.
    #[serde(rename = "directory-archived", rename_all = "camelCase")]
    DirectoryArchived {
        /// Archived directory id.
        directory_id: String,
    },

    /// A repository was created or updated.
    #[serde(rename = "repository-updated", rename_all = "camelCase")]
    RepositoryUpdated {
        /// The repository.
        repository: Repository,
    },

    /// A repository was archived.
    #[serde(rename = "repository-archived", rename_all = "camelCase")]
    RepositoryArchived {
        /// Archived repository id.
        repository_id: String,
    },

    /// A task was created or updated (including claims and status moves).
    #[serde(rename = "task-updated", rename_all = "camelCase")]
    TaskUpdated {
        /// The task.
        task: Task,
    },

    /// A task was deleted.
    #[serde(rename = "task-deleted", rename_all = "camelCase")]
    TaskDeleted {
        /// Deleted task id.
        task_id: String,
    },
}

impl StreamEventBody {
    /// Session id for session-centric events, if this event has one.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionStatus { session_id, .. }
            | Self::SessionControl { session_id, .. }
            | Self::SessionKeyEvent { session_id, .. }
            | Self::SessionPromptEvent { session_id, .. }
            | Self::SessionOutput { session_id, .. }
            | Self::SessionEvent { session_id, .. }
            | Self::SessionRemoved { session_id } => Some(session_id),
            _ => None,
        }
    }

    /// Whether this is a `session-output` event (gated by `includeOutput`).
    #[must_use]
    pub const fn is_output(&self) -> bool {
        matches!(self, Self::SessionOutput { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_wire_shape() {
        let body = StreamEventBody::SessionStatus {
            session_id: "conversation-status-1".into(),
            status: RuntimeStatus::Running,
            attention_reason: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "session-status");
        assert_eq!(json["sessionId"], "conversation-status-1");
        assert_eq!(json["status"], "running");
        assert!(json.get("attentionReason").is_none());
    }

    #[test]
    fn test_event_scope_flattens_tenant_fields() {
        let scope = EventScope::directory(
            Scope {
                tenant_id: "t".into(),
                user_id: "u".into(),
                workspace_id: "w".into(),
            },
            "directory-a",
        );
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["tenantId"], "t");
        assert_eq!(json["directoryId"], "directory-a");
    }

    #[test]
    fn test_session_event_round_trip() {
        let event = SessionEvent::SessionExit {
            exit: ExitStatus {
                code: None,
                signal: Some("SIGTERM".into()),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"session-exit\""));
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
