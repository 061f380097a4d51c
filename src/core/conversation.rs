use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::Scope;

/// A single agent conversation (thread). The durable identity of a session;
/// a live PTY shares the same id while it exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique identifier (`conversationId` == `sessionId` for live PTYs).
    pub id: String,

    /// Owning scope.
    pub scope: Scope,

    /// Directory this thread is bound to, if any.
    pub directory_id: Option<String>,

    /// Display title (may be refreshed by the thread-title namer).
    pub title: String,

    /// Which agent runs in this thread.
    pub agent_type: AgentType,

    /// Per-agent extension metadata (resume ids and the like).
    #[serde(default)]
    pub adapter_state: AdapterState,

    /// Derived runtime status projection.
    #[serde(default)]
    pub runtime_status: RuntimeStatus,

    /// Whether a live PTY currently backs this thread.
    #[serde(default)]
    pub runtime_live: bool,

    /// Why the thread needs attention, when status is `needs-input`.
    pub attention_reason: Option<String>,

    /// OS process id of the live PTY child, if any.
    pub runtime_process_id: Option<u32>,

    /// Timestamp of the last telemetry or hook event applied.
    pub runtime_last_event_at: Option<DateTime<Utc>>,

    /// Exit outcome once the PTY child has terminated.
    pub runtime_last_exit: Option<ExitStatus>,

    /// When the thread was created.
    pub created_at: DateTime<Utc>,

    /// When the thread was archived, if it was.
    pub archived_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Create a new thread with default runtime projection.
    #[must_use]
    pub fn new(id: String, scope: Scope, agent_type: AgentType, title: String) -> Self {
        Self {
            id,
            scope,
            directory_id: None,
            title,
            agent_type,
            adapter_state: AdapterState::default(),
            runtime_status: RuntimeStatus::default(),
            runtime_live: false,
            attention_reason: None,
            runtime_process_id: None,
            runtime_last_event_at: None,
            runtime_last_exit: None,
            created_at: Utc::now(),
            archived_at: None,
        }
    }

    /// Whether the thread has been archived.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Adapter-state slot for this thread's own agent, created on demand.
    pub fn own_adapter_slot(&mut self) -> Option<&mut AdapterSlot> {
        match self.agent_type {
            AgentType::Codex => Some(self.adapter_state.codex.get_or_insert_default()),
            AgentType::Claude => Some(self.adapter_state.claude.get_or_insert_default()),
            AgentType::Cursor => Some(self.adapter_state.cursor.get_or_insert_default()),
            AgentType::Terminal => None,
        }
    }
}

/// Which agent binary a thread runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// OpenAI Codex CLI.
    Codex,

    /// Claude Code CLI.
    #[default]
    Claude,

    /// Cursor agent CLI.
    Cursor,

    /// A plain interactive shell.
    Terminal,
}

impl AgentType {
    /// Whether this thread type is driven by an AI agent (as opposed to a
    /// plain shell).
    #[must_use]
    pub const fn is_agent(self) -> bool {
        !matches!(self, Self::Terminal)
    }
}

impl std::str::FromStr for AgentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "codex" => Ok(Self::Codex),
            "claude" => Ok(Self::Claude),
            "cursor" => Ok(Self::Cursor),
            "terminal" => Ok(Self::Terminal),
            _ => anyhow::bail!("unknown agent type: {s}"),
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::Cursor => "cursor",
            Self::Terminal => "terminal",
        };
        write!(f, "{s}")
    }
}

/// Derived runtime status of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeStatus {
    /// Agent is actively working.
    Running,

    /// Last turn finished; waiting for the next prompt.
    #[default]
    Completed,

    /// Agent is blocked on an approval or permission request.
    NeedsInput,

    /// The PTY child has terminated.
    Exited,
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::NeedsInput => "needs-input",
            Self::Exited => "exited",
        };
        write!(f, "{s}")
    }
}

/// Exit outcome of a PTY child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExitStatus {
    /// Exit code, when the child exited normally.
    pub code: Option<i32>,

    /// Terminating signal name (`SIGKILL` etc.), when killed by a signal.
    pub signal: Option<String>,
}

impl ExitStatus {
    /// An exit that should be treated as a failure for lifecycle purposes.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.signal.is_some() || self.code.is_some_and(|c| c != 0)
    }
}

/// Per-agent extension metadata stored on a conversation.
///
/// Known agents get a typed slot; anything else round-trips through the
/// flattened map so unknown writers are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterState {
    /// Codex-specific state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex: Option<AdapterSlot>,

    /// Claude-specific state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude: Option<AdapterSlot>,

    /// Cursor-specific state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<AdapterSlot>,

    /// Forward-compat: slots written by adapters this build does not know.
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, serde_json::Value>,
}

/// One agent's slot inside [`AdapterState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterSlot {
    /// Provider-side thread/session id usable for `resume`.
    pub resume_session_id: Option<String>,

    /// When the provider id was last observed.
    pub last_observed_at: Option<DateTime<Utc>>,
}

/// An exclusive lease identifying who is steering a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Controller {
    /// Controller identifier (stable across claims).
    pub id: String,

    /// What kind of controller holds the lease.
    pub kind: ControllerType,

    /// Display label used in conflict errors and attribution.
    pub label: String,

    /// When the lease was taken.
    pub claimed_at: DateTime<Utc>,
}

/// What kind of controller holds a session lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    /// A human operator driving a terminal UI.
    #[default]
    Operator,

    /// An automation agent.
    Automation,
}
