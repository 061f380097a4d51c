use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::conversation::{AgentType, ControllerType};
use crate::core::policy::{PolicyScope, TaskFocusMode, ThreadSpawnMode};

/// Typed command vocabulary. Commands are internally tagged on `type` using
/// the dotted names clients send, e.g. `{"type":"task.pull", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    // ── Directories ────────────────────────────────────────────────────
    /// Register or update a directory.
    #[serde(rename = "directory.upsert", rename_all = "camelCase")]
    DirectoryUpsert {
        /// Explicit id; derived from the path when omitted.
        directory_id: Option<String>,
        /// Absolute project root path.
        path: String,
    },

    /// Archive a directory.
    #[serde(rename = "directory.archive", rename_all = "camelCase")]
    DirectoryArchive {
        /// Target directory.
        directory_id: String,
    },

    /// List directories in scope.
    #[serde(rename = "directory.list", rename_all = "camelCase")]
    DirectoryList {
        /// Include archived rows.
        #[serde(default)]
        include_archived: bool,
    },

    /// Read (refreshing if stale) the git status snapshot for a directory.
    #[serde(rename = "directory.git-status", rename_all = "camelCase")]
    DirectoryGitStatus {
        /// Target directory.
        directory_id: String,
    },

    // ── Repositories ───────────────────────────────────────────────────
    /// Register or update a repository.
    #[serde(rename = "repository.upsert", rename_all = "camelCase")]
    RepositoryUpsert {
        /// Explicit id; derived from the remote URL when omitted.
        repository_id: Option<String>,
        /// Display name.
        name: String,
        /// Remote URL (normalized on write).
        remote_url: String,
        /// Default branch; `main` when omitted.
        default_branch: Option<String>,
        /// Free-form metadata.
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    },

    /// Fetch one repository.
    #[serde(rename = "repository.get", rename_all = "camelCase")]
    RepositoryGet {
        /// Target repository.
        repository_id: String,
    },

    /// Patch an existing repository. Fails with NotFound for unknown ids.
    #[serde(rename = "repository.update", rename_all = "camelCase")]
    RepositoryUpdate {
        /// Target repository.
        repository_id: String,
        /// Fields to change.
        patch: RepositoryPatch,
    },

    /// Archive a repository.
    #[serde(rename = "repository.archive", rename_all = "camelCase")]
    RepositoryArchive {
        /// Target repository.
        repository_id: String,
    },

    /// List repositories in scope.
    #[serde(rename = "repository.list", rename_all = "camelCase")]
    RepositoryList {
        /// Include archived rows.
        #[serde(default)]
        include_archived: bool,
    },

    // ── Conversations ──────────────────────────────────────────────────
    /// Create a thread.
    #[serde(rename = "conversation.create", rename_all = "camelCase")]
    ConversationCreate {
        /// Explicit id; generated when omitted.
        conversation_id: Option<String>,
        /// Directory binding.
        directory_id: Option<String>,
        /// Initial title; defaults to `untitled`.
        title: Option<String>,
        /// Agent type; defaults to `claude`.
        agent_type: Option<AgentType>,
    },

    /// Update a thread's title or directory binding.
    #[serde(rename = "conversation.update", rename_all = "camelCase")]
    ConversationUpdate {
        /// Target thread.
        conversation_id: String,
        /// New title, when changing.
        title: Option<String>,
        /// New directory binding, when changing.
        directory_id: Option<String>,
    },

    /// Archive a thread. Archived threads are inert for replay and fan-out.
    #[serde(rename = "conversation.archive", rename_all = "camelCase")]
    ConversationArchive {
        /// Target thread.
        conversation_id: String,
    },

    /// Delete a thread.
    #[serde(rename = "conversation.delete", rename_all = "camelCase")]
    ConversationDelete {
        /// Target thread.
        conversation_id: String,
    },

    /// List threads.
    #[serde(rename = "conversation.list", rename_all = "camelCase")]
    ConversationList {
        /// Restrict to one directory.
        directory_id: Option<String>,
        /// Include archived threads.
        #[serde(default)]
        include_archived: bool,
    },

    /// Re-derive a thread title from its prompt history.
    #[serde(rename = "conversation.title.refresh", rename_all = "camelCase")]
    ConversationTitleRefresh {
        /// Target thread.
        conversation_id: String,
    },

    // ── Tasks ──────────────────────────────────────────────────────────
    /// Create a draft task.
    #[serde(rename = "task.create", rename_all = "camelCase")]
    TaskCreate {
        /// Explicit id; generated when omitted.
        task_id: Option<String>,
        /// Short title.
        title: String,
        /// Body text.
        #[serde(default)]
        body: String,
        /// Repository scoping.
        repository_id: Option<String>,
        /// Project (directory) scoping.
        project_id: Option<String>,
        /// Explicit order index; appended when omitted.
        order_index: Option<i64>,
        /// Base branch the work branch forks from.
        base_branch: Option<String>,
    },

    /// Update task fields.
    #[serde(rename = "task.update", rename_all = "camelCase")]
    TaskUpdate {
        /// Target task.
        task_id: String,
        /// New title.
        title: Option<String>,
        /// New body.
        body: Option<String>,
        /// New base branch.
        base_branch: Option<String>,
    },

    /// Delete a task.
    #[serde(rename = "task.delete", rename_all = "camelCase")]
    TaskDelete {
        /// Target task.
        task_id: String,
    },

    /// Mark a draft task ready for pull.
    #[serde(rename = "task.ready", rename_all = "camelCase")]
    TaskReady {
        /// Target task.
        task_id: String,
    },

    /// Return a task to draft, releasing any claim.
    #[serde(rename = "task.draft", rename_all = "camelCase")]
    TaskDraft {
        /// Target task.
        task_id: String,
    },

    /// Re-queue an in-progress task as ready, releasing its claim.
    #[serde(rename = "task.queue", rename_all = "camelCase")]
    TaskQueue {
        /// Target task.
        task_id: String,
    },

    /// Claim a ready task for a controller.
    #[serde(rename = "task.claim", rename_all = "camelCase")]
    TaskClaim {
        /// Target task.
        task_id: String,
        /// Claiming controller.
        controller_id: String,
        /// Directory the claim binds to.
        directory_id: Option<String>,
        /// Work branch name.
        branch_name: Option<String>,
        /// Base branch override.
        base_branch: Option<String>,
    },

    /// Complete an in-progress task.
    #[serde(rename = "task.complete", rename_all = "camelCase")]
    TaskComplete {
        /// Target task.
        task_id: String,
    },

    /// Pull the single best ready task for a controller.
    #[serde(rename = "task.pull", rename_all = "camelCase")]
    TaskPull {
        /// Pulling controller.
        controller_id: String,
        /// Directory context, when pulling for a directory.
        directory_id: Option<String>,
        /// Repository context, when pulling for a repository.
        repository_id: Option<String>,
    },

    /// Reorder tasks; ids are assigned ascending order indexes.
    #[serde(rename = "task.reorder", rename_all = "camelCase")]
    TaskReorder {
        /// Task ids in desired order.
        task_ids: Vec<String>,
    },

    /// List tasks.
    #[serde(rename = "task.list", rename_all = "camelCase")]
    TaskList {
        /// Restrict to one status.
        status: Option<String>,
        /// Restrict to one repository.
        repository_id: Option<String>,
        /// Restrict to one project.
        project_id: Option<String>,
    },

    /// Fetch one task.
    #[serde(rename = "task.get", rename_all = "camelCase")]
    TaskGet {
        /// Target task.
        task_id: String,
    },

    // ── Project settings & policies ────────────────────────────────────
    /// Read a directory's project settings.
    #[serde(rename = "project.settings-get", rename_all = "camelCase")]
    ProjectSettingsGet {
        /// Target directory.
        directory_id: String,
    },

    /// Update a directory's project settings.
    #[serde(rename = "project.settings-update", rename_all = "camelCase")]
    ProjectSettingsUpdate {
        /// Target directory.
        directory_id: String,
        /// New pinned branch (null clears).
        pinned_branch: Option<String>,
        /// New focus mode.
        task_focus_mode: Option<TaskFocusMode>,
        /// New spawn mode.
        thread_spawn_mode: Option<ThreadSpawnMode>,
    },

    /// Combined settings/policy/git-status projection for a directory.
    #[serde(rename = "project.status", rename_all = "camelCase")]
    ProjectStatus {
        /// Target directory.
        directory_id: String,
    },

    /// Read the automation policy at a scope.
    #[serde(rename = "automation.policy-get", rename_all = "camelCase")]
    AutomationPolicyGet {
        /// Policy level.
        scope: PolicyScope,
        /// Directory or repository id for non-global levels.
        scope_id: Option<String>,
    },

    /// Write the automation policy at a scope.
    #[serde(rename = "automation.policy-set", rename_all = "camelCase")]
    AutomationPolicySet {
        /// Policy level.
        scope: PolicyScope,
        /// Directory or repository id for non-global levels.
        scope_id: Option<String>,
        /// Whether automation is enabled.
        automation_enabled: Option<bool>,
        /// Whether the policy is frozen.
        frozen: Option<bool>,
    },

    // ── Sessions ───────────────────────────────────────────────────────
    /// Runtime status projection for one session.
    #[serde(rename = "session.status", rename_all = "camelCase")]
    SessionStatus {
        /// Target session.
        session_id: String,
    },

    /// List live session runtimes.
    #[serde(rename = "session.list")]
    SessionList {},

    /// Take the controller lease for a session.
    #[serde(rename = "session.claim", rename_all = "camelCase")]
    SessionClaim {
        /// Target session.
        session_id: String,
        /// Claiming controller id.
        controller_id: String,
        /// Controller kind; defaults to operator.
        controller_type: Option<ControllerType>,
        /// Display label; defaults to the controller id.
        controller_label: Option<String>,
    },

    /// Replace the controller lease regardless of the current holder.
    #[serde(rename = "session.takeover", rename_all = "camelCase")]
    SessionTakeover {
        /// Target session.
        session_id: String,
        /// New controller id.
        controller_id: String,
        /// Controller kind; defaults to operator.
        controller_type: Option<ControllerType>,
        /// Display label; defaults to the controller id.
        controller_label: Option<String>,
    },

    /// Release the controller lease.
    #[serde(rename = "session.release", rename_all = "camelCase")]
    SessionRelease {
        /// Target session.
        session_id: String,
        /// Releasing controller id.
        controller_id: String,
    },

    /// Answer a needs-input prompt by writing a line to the PTY.
    #[serde(rename = "session.respond", rename_all = "camelCase")]
    SessionRespond {
        /// Target session.
        session_id: String,
        /// Text to write (a newline is appended).
        text: String,
    },

    /// Send SIGINT to the session's child.
    #[serde(rename = "session.interrupt", rename_all = "camelCase")]
    SessionInterrupt {
        /// Target session.
        session_id: String,
    },

    /// Delete the in-memory runtime. Does not archive the conversation.
    #[serde(rename = "session.remove", rename_all = "camelCase")]
    SessionRemove {
        /// Target session.
        session_id: String,
    },

    // ── PTY ────────────────────────────────────────────────────────────
    /// Start a PTY for a conversation.
    #[serde(rename = "pty.start", rename_all = "camelCase")]
    PtyStart {
        /// Session id (== conversation id).
        session_id: String,
        /// Agent type when the conversation does not exist yet.
        agent_type: Option<AgentType>,
        /// User-supplied arguments, passed through launch composition.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory; defaults to the bound directory's path.
        cwd: Option<String>,
        /// Initial PTY width.
        initial_cols: Option<u16>,
        /// Initial PTY height.
        initial_rows: Option<u16>,
        /// Launch mode; `yolo` adds `--yolo` for codex.
        launch_mode: Option<String>,
        /// Whether telemetry export is wired in; defaults to true.
        telemetry: Option<bool>,
    },

    /// Attach this connection to a session's output stream.
    #[serde(rename = "pty.attach", rename_all = "camelCase")]
    PtyAttach {
        /// Target session.
        session_id: String,
        /// Replay chunks with cursor greater than this.
        since_cursor: Option<u64>,
    },

    /// Detach a previous attachment.
    #[serde(rename = "pty.detach", rename_all = "camelCase")]
    PtyDetach {
        /// Target session.
        session_id: String,
        /// Attachment to drop; all of this connection's when omitted.
        attachment_id: Option<String>,
    },

    /// Receive `pty.event` envelopes for a session on this connection.
    #[serde(rename = "pty.subscribe-events", rename_all = "camelCase")]
    PtySubscribeEvents {
        /// Target session.
        session_id: String,
    },

    /// Stop receiving `pty.event` envelopes for a session.
    #[serde(rename = "pty.unsubscribe-events", rename_all = "camelCase")]
    PtyUnsubscribeEvents {
        /// Target session.
        session_id: String,
    },

    /// Close a session's PTY (terminates the child).
    #[serde(rename = "pty.close", rename_all = "camelCase")]
    PtyClose {
        /// Target session.
        session_id: String,
    },

    // ── Stream ─────────────────────────────────────────────────────────
    /// Register a filtered fan-out subscription on this connection.
    #[serde(rename = "stream.subscribe", rename_all = "camelCase")]
    StreamSubscribe {
        /// Restrict to one repository.
        repository_id: Option<String>,
        /// Restrict to one task.
        task_id: Option<String>,
        /// Restrict to one directory.
        directory_id: Option<String>,
        /// Restrict to one conversation.
        conversation_id: Option<String>,
        /// Whether `session-output` events are delivered.
        #[serde(default)]
        include_output: bool,
        /// Seed catch-up replay of retained events after this cursor.
        after_cursor: Option<u64>,
    },

    /// Drop a subscription.
    #[serde(rename = "stream.unsubscribe", rename_all = "camelCase")]
    StreamUnsubscribe {
        /// Subscription to drop.
        subscription_id: String,
    },

    // ── GitHub ─────────────────────────────────────────────────────────
    /// Create a pull request via the injected GitHub client.
    #[serde(rename = "github.pr-create", rename_all = "camelCase")]
    GithubPrCreate {
        /// Directory whose repository the PR targets.
        directory_id: String,
        /// PR title.
        title: String,
        /// PR body.
        #[serde(default)]
        body: String,
        /// Base branch; repository default when omitted.
        base: Option<String>,
        /// Head branch.
        head: String,
    },

    /// Look up the open PR for a directory's current branch.
    #[serde(rename = "github.project-pr", rename_all = "camelCase")]
    GithubProjectPr {
        /// Target directory.
        directory_id: String,
    },
}

/// Patch payload for `repository.update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryPatch {
    /// New display name.
    pub name: Option<String>,

    /// New default branch.
    pub default_branch: Option<String>,

    /// Metadata entries to merge (null values delete keys).
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_start_wire_shape() {
        let line = r#"{"type":"pty.start","sessionId":"conversation-1","args":["exec","say hi"],"env":{"FOO":"bar"},"initialCols":80,"initialRows":24}"#;
        let command: Command = serde_json::from_str(line).unwrap();
        match command {
            Command::PtyStart {
                session_id,
                args,
                env,
                initial_cols,
                initial_rows,
                ..
            } => {
                assert_eq!(session_id, "conversation-1");
                assert_eq!(args, vec!["exec", "say hi"]);
                assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
                assert_eq!(initial_cols, Some(80));
                assert_eq!(initial_rows, Some(24));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_task_pull_defaults() {
        let line = r#"{"type":"task.pull","controllerId":"controller-a"}"#;
        let command: Command = serde_json::from_str(line).unwrap();
        assert_eq!(
            command,
            Command::TaskPull {
                controller_id: "controller-a".into(),
                directory_id: None,
                repository_id: None,
            }
        );
    }

    #[test]
    fn test_command_round_trip() {
        let command = Command::SessionClaim {
            session_id: "conversation-x".into(),
            controller_id: "controller-a".into(),
            controller_type: None,
            controller_label: Some("operator-a".into()),
        };
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"type\":\"session.claim\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, command);
    }
}
