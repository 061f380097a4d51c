//! Session supervisor: the registry of live PTY runtimes, controller
//! arbitration, launch composition, and exit handling.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agents::{self, LaunchContext, LaunchMode, TelemetryTarget};
use crate::core::conversation::{Controller, ControllerType, RuntimeStatus};
use crate::core::keyevent::StatusHint;
use crate::core::{AgentType, KeyEvent};
use crate::hooks::poller::spawn_notify_poller;
use crate::protocol::SignalKind;
use crate::protocol::event::{EventScope, StreamEventBody};
use crate::pty::{OutputChunk, PtySession};
use crate::status::StatusDeriver;
use crate::store::StateStore;
use crate::telemetry::TokenRegistry;

/// Parameters for starting a session PTY.
#[derive(Debug, Default)]
pub struct StartSessionParams {
    /// Session id (== conversation id).
    pub session_id: String,

    /// Agent type when the conversation does not exist yet.
    pub agent_type: Option<AgentType>,

    /// User-supplied arguments.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: HashMap<String, String>,

    /// Working directory override.
    pub cwd: Option<String>,

    /// Initial PTY size.
    pub initial_cols: Option<u16>,

    /// Initial PTY size.
    pub initial_rows: Option<u16>,

    /// Launch mode override.
    pub launch_mode: Option<LaunchMode>,

    /// Whether telemetry export is wired in (default true).
    pub telemetry: Option<bool>,
}

/// One live session runtime.
pub struct SessionHandle {
    /// Conversation this runtime backs.
    pub conversation_id: String,

    /// The PTY.
    pty: Mutex<PtySession>,

    /// Exclusive controller lease.
    controller: Mutex<Option<Controller>>,

    /// Attachment ids handed out to connections.
    attachments: Mutex<HashSet<Uuid>>,

    /// Telemetry token minted for this runtime.
    pub telemetry_token: String,

    /// Notify file adapter hooks append to.
    pub notify_path: PathBuf,

    /// Startup parameters the runtime was launched with.
    pub startup_args: Vec<String>,

    cancel: CancellationToken,
}

/// Session projection returned by `session.status` / `session.list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    /// Session id.
    pub session_id: String,

    /// Derived runtime status.
    pub status: RuntimeStatus,

    /// Whether a live PTY backs the session.
    pub live: bool,

    /// Child pid, when alive.
    pub process_id: Option<u32>,

    /// Current controller lease.
    pub controller: Option<Controller>,

    /// Latest telemetry summary retained for the session.
    pub latest_telemetry: Option<KeyEvent>,

    /// Latest output cursor.
    pub cursor: u64,
}

/// The supervisor. One per daemon.
pub struct SessionSupervisor {
    state: Arc<StateStore>,
    deriver: Arc<StatusDeriver>,
    tokens: Arc<TokenRegistry>,
    telemetry_base_url: String,
    default_launch_mode: LaunchMode,
    notify_dir: PathBuf,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionSupervisor {
    /// Build a supervisor.
    #[must_use]
    pub fn new(
        state: Arc<StateStore>,
        deriver: Arc<StatusDeriver>,
        tokens: Arc<TokenRegistry>,
        telemetry_base_url: String,
        default_launch_mode: LaunchMode,
        notify_dir: PathBuf,
    ) -> Self {
        Self {
            state,
            deriver,
            tokens,
            telemetry_base_url,
            default_launch_mode,
            notify_dir,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a live runtime.
    pub async fn session(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Start a PTY for a conversation, creating the conversation row when
    /// it does not exist yet.
    ///
    /// # Errors
    ///
    /// Fails when a runtime already exists for the session or the child
    /// cannot be spawned.
    pub async fn start_session(&self, params: StartSessionParams) -> anyhow::Result<SessionView> {
        let session_id = params.session_id.clone();
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(&session_id) {
                anyhow::bail!("session already exists: {session_id}");
            }
        }

        let mut conversation = match self.state.conversation(&session_id).await {
            Ok(conversation) => conversation,
            Err(_) => {
                self.state
                    .create_conversation(
                        Some(session_id.clone()),
                        None,
                        None,
                        params.agent_type.unwrap_or_default(),
                    )
                    .await?
            }
        };
        if conversation.is_archived() {
            anyhow::bail!("conversation not found: {session_id}");
        }

        let telemetry_enabled = params.telemetry.unwrap_or(true);
        let token = self.tokens.mint(&session_id);
        let notify_path = self.notify_dir.join(format!("{session_id}.jsonl"));
        tokio::fs::create_dir_all(&self.notify_dir).await.ok();

        let resume_session_id = match conversation.agent_type {
            AgentType::Codex => conversation
                .adapter_state
                .codex
                .as_ref()
                .and_then(|s| s.resume_session_id.clone()),
            _ => None,
        };

        let ctx = LaunchContext {
            session_id: &session_id,
            user_args: &params.args,
            launch_mode: params.launch_mode.unwrap_or(self.default_launch_mode),
            telemetry: telemetry_enabled.then(|| TelemetryTarget {
                exporter_url: format!("{}/v1/logs/{token}", self.telemetry_base_url),
            }),
            resume_session_id: resume_session_id.as_deref(),
            notify_file: &notify_path,
        };
        let spec = agents::compose_launch(conversation.agent_type, &ctx);

        let cwd = match &params.cwd {
            Some(cwd) => Some(cwd.clone()),
            None => match &conversation.directory_id {
                Some(dir) => self.state.directory(dir).await.ok().map(|d| d.path),
                None => None,
            },
        };

        let mut env: Vec<(String, String)> = spec.env.clone();
        for (key, value) in &params.env {
            env.push((key.clone(), value.clone()));
        }

        let pty = PtySession::spawn(
            &session_id,
            &spec.program,
            &spec.args,
            &env,
            cwd.as_deref(),
            params.initial_cols.unwrap_or(80),
            params.initial_rows.unwrap_or(24),
        )?;
        let process_id = pty.child_pid();
        let cancel = CancellationToken::new();

        // Forward output chunks into the fan-out and flip the session to
        // running on the first chunk.
        {
            let output_rx = pty.subscribe();
            let state = Arc::clone(&self.state);
            let deriver = Arc::clone(&self.deriver);
            let router = Arc::clone(self.state.router());
            let scope = EventScope::conversation(
                conversation.scope.clone(),
                &session_id,
                conversation.directory_id.as_deref(),
            );
            let session = session_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                forward_output(output_rx, state, deriver, router, scope, session, cancel).await;
            });
        }

        // Record the exit when the child terminates.
        {
            let mut exit_rx = pty.exit_watch();
            let deriver = Arc::clone(&self.deriver);
            let tokens = Arc::clone(&self.tokens);
            let session = session_id.clone();
            tokio::spawn(async move {
                loop {
                    let exit = exit_rx.borrow().clone();
                    if let Some(exit) = exit {
                        if let Err(e) = deriver.apply_exit(&session, exit).await {
                            tracing::error!(session_id = %session, error = %e, "Failed to record exit");
                        }
                        tokens.revoke_session(&session);
                        break;
                    }
                    if exit_rx.changed().await.is_err() {
                        break;
                    }
                }
            });
        }

        spawn_notify_poller(
            session_id.clone(),
            notify_path.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.deriver),
            cancel.clone(),
        );

        conversation.runtime_live = true;
        conversation.runtime_process_id = process_id;
        self.state.persist_conversation(&conversation).await?;

        let handle = Arc::new(SessionHandle {
            conversation_id: session_id.clone(),
            pty: Mutex::new(pty),
            controller: Mutex::new(None),
            attachments: Mutex::new(HashSet::new()),
            telemetry_token: token,
            notify_path,
            startup_args: params.args,
            cancel,
        });
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), Arc::clone(&handle));

        Ok(SessionView {
            session_id,
            status: conversation.runtime_status,
            live: true,
            process_id,
            controller: None,
            latest_telemetry: None,
            cursor: 0,
        })
    }

    /// Runtime status projection for one session.
    ///
    /// # Errors
    ///
    /// Fails with `conversation not found` for unknown ids.
    pub async fn session_status(&self, session_id: &str) -> anyhow::Result<SessionView> {
        let conversation = self.state.conversation(session_id).await?;
        let handle = self.session(session_id).await;

        let (live, process_id, controller, cursor) = match &handle {
            Some(handle) => {
                let pty = handle.pty.lock().await;
                let live = pty.exit_status().is_none();
                let pid = live.then(|| pty.child_pid()).flatten();
                let cursor = pty.latest_cursor();
                drop(pty);
                let controller = handle.controller.lock().await.clone();
                (live, pid, controller, cursor)
            }
            None => (false, None, None, 0),
        };

        Ok(SessionView {
            session_id: session_id.to_string(),
            status: conversation.runtime_status,
            live,
            process_id,
            controller,
            latest_telemetry: self.deriver.last_known_work(session_id),
            cursor,
        })
    }

    /// Views for every live runtime.
    pub async fn list_sessions(&self) -> Vec<SessionView> {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(view) = self.session_status(&id).await {
                views.push(view);
            }
        }
        views
    }

    /// Take the controller lease for a session.
    ///
    /// # Errors
    ///
    /// Fails with `session is already claimed by <label>` when another
    /// controller holds the lease and `takeover` is false.
    pub async fn claim_session(
        &self,
        session_id: &str,
        controller_id: &str,
        controller_type: ControllerType,
        controller_label: Option<String>,
        takeover: bool,
    ) -> anyhow::Result<Controller> {
        let handle = self
            .session(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {session_id}"))?;

        let mut lease = handle.controller.lock().await;
        if let Some(existing) = lease.as_ref() {
            if existing.id != controller_id && !takeover {
                anyhow::bail!("session is already claimed by {}", existing.label);
            }
        }

        let controller = Controller {
            id: controller_id.to_string(),
            kind: controller_type,
            label: controller_label.unwrap_or_else(|| controller_id.to_string()),
            claimed_at: Utc::now(),
        };
        *lease = Some(controller.clone());
        drop(lease);

        self.emit_control(session_id, Some(controller.clone())).await;
        Ok(controller)
    }

    /// Release the controller lease.
    ///
    /// # Errors
    ///
    /// Fails with `conversation not found` for unknown sessions.
    pub async fn release_session(
        &self,
        session_id: &str,
        controller_id: &str,
    ) -> anyhow::Result<()> {
        let handle = self
            .session(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {session_id}"))?;

        let mut lease = handle.controller.lock().await;
        if lease.as_ref().is_some_and(|c| c.id == controller_id) {
            *lease = None;
            drop(lease);
            self.emit_control(session_id, None).await;
        }
        Ok(())
    }

    async fn emit_control(&self, session_id: &str, controller: Option<Controller>) {
        if let Ok(conversation) = self.state.conversation(session_id).await {
            self.state
                .emit(
                    EventScope::conversation(
                        conversation.scope.clone(),
                        session_id,
                        conversation.directory_id.as_deref(),
                    ),
                    StreamEventBody::SessionControl {
                        session_id: session_id.to_string(),
                        controller,
                    },
                )
                .await;
        }
    }

    /// Write raw bytes to a session's PTY.
    ///
    /// # Errors
    ///
    /// Fails for unknown sessions or closed PTYs.
    pub async fn write_input(&self, session_id: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let handle = self
            .session(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {session_id}"))?;
        handle.pty.lock().await.write(bytes).await
    }

    /// Resize a session's PTY.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        if let Some(handle) = self.session(session_id).await {
            handle.pty.lock().await.resize(cols, rows).await;
        }
    }

    /// Deliver a signal to a session's child.
    ///
    /// # Errors
    ///
    /// Fails for unknown sessions or reaped children.
    pub async fn signal(&self, session_id: &str, kind: SignalKind) -> anyhow::Result<()> {
        let handle = self
            .session(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {session_id}"))?;
        handle.pty.lock().await.signal(kind)
    }

    /// Answer a needs-input prompt: writes `text` plus newline and flips
    /// the session back to running.
    ///
    /// # Errors
    ///
    /// Fails for unknown sessions or closed PTYs.
    pub async fn respond(&self, session_id: &str, text: &str) -> anyhow::Result<()> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(b'\n');
        self.write_input(session_id, bytes).await?;
        self.deriver
            .apply_hint(session_id, StatusHint::Running, Utc::now(), None)
            .await?;
        Ok(())
    }

    /// Attach to a session's output: returns the attachment id, the replay
    /// of retained chunks past `since_cursor`, and the live receiver.
    ///
    /// # Errors
    ///
    /// Fails with `conversation not found` for unknown sessions.
    pub async fn attach(
        &self,
        session_id: &str,
        since_cursor: Option<u64>,
    ) -> anyhow::Result<(Uuid, Vec<OutputChunk>, broadcast::Receiver<OutputChunk>)> {
        let handle = self
            .session(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {session_id}"))?;

        let pty = handle.pty.lock().await;
        let live_rx = pty.subscribe();
        let replay = pty.replay_after(since_cursor.unwrap_or(0)).await;
        drop(pty);

        let attachment_id = Uuid::new_v4();
        handle.attachments.lock().await.insert(attachment_id);
        Ok((attachment_id, replay, live_rx))
    }

    /// Drop an attachment.
    pub async fn detach(&self, session_id: &str, attachment_id: Uuid) {
        if let Some(handle) = self.session(session_id).await {
            handle.attachments.lock().await.remove(&attachment_id);
        }
    }

    /// Close a session's PTY, terminating the child. The runtime stays
    /// registered (status `exited`) until `session.remove`.
    ///
    /// # Errors
    ///
    /// Fails with `conversation not found` for unknown sessions.
    pub async fn close_session(&self, session_id: &str) -> anyhow::Result<()> {
        let handle = self
            .session(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {session_id}"))?;
        handle.pty.lock().await.close().await;
        Ok(())
    }

    /// Delete the in-memory runtime and emit `session-removed`. Does not
    /// archive the durable conversation.
    ///
    /// # Errors
    ///
    /// Fails with `conversation not found` for unknown sessions.
    pub async fn remove_session(&self, session_id: &str) -> anyhow::Result<()> {
        let handle = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {session_id}"))?;

        handle.cancel.cancel();
        handle.pty.lock().await.close().await;
        self.tokens.revoke_session(session_id);
        self.deriver.forget_session(session_id);

        if let Ok(mut conversation) = self.state.conversation(session_id).await {
            conversation.runtime_live = false;
            conversation.runtime_process_id = None;
            let _ = self.state.persist_conversation(&conversation).await;
            self.state
                .emit(
                    EventScope::conversation(
                        conversation.scope.clone(),
                        session_id,
                        conversation.directory_id.as_deref(),
                    ),
                    StreamEventBody::SessionRemoved {
                        session_id: session_id.to_string(),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Close every live runtime (daemon shutdown).
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.lock().await.values().cloned().collect();
        for handle in handles {
            handle.cancel.cancel();
            handle.pty.lock().await.close().await;
        }
        self.sessions.lock().await.clear();
    }
}

async fn forward_output(
    mut output_rx: broadcast::Receiver<OutputChunk>,
    state: Arc<StateStore>,
    deriver: Arc<StatusDeriver>,
    router: Arc<crate::router::SubscriptionRouter>,
    scope: EventScope,
    session_id: String,
    cancel: CancellationToken,
) {
    use base64::Engine;

    let mut first_chunk = true;
    let mut last_cursor = 0u64;
    loop {
        tokio::select! {
            chunk = output_rx.recv() => {
                match chunk {
                    Ok(chunk) => {
                        if first_chunk {
                            first_chunk = false;
                            if let Err(e) = deriver
                                .apply_hint(&session_id, StatusHint::Running, Utc::now(), None)
                                .await
                            {
                                tracing::warn!(session_id = %session_id, error = %e, "First-output status flip failed");
                            }
                        }
                        if chunk.cursor <= last_cursor {
                            router.record_cursor_regression();
                        }
                        last_cursor = last_cursor.max(chunk.cursor);

                        let encoded = base64::prelude::BASE64_STANDARD.encode(&chunk.bytes);
                        state
                            .emit(
                                scope.clone(),
                                StreamEventBody::SessionOutput {
                                    session_id: session_id.clone(),
                                    cursor: chunk.cursor,
                                    chunk_base64: encoded,
                                },
                            )
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id = %session_id, skipped, "Output forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Scope;
    use crate::router::SubscriptionRouter;
    use crate::store::SqliteStore;

    async fn supervisor() -> (Arc<StateStore>, SessionSupervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let router = Arc::new(SubscriptionRouter::new());
        let state = Arc::new(StateStore::new(store, router, Scope::default()));
        let deriver = Arc::new(StatusDeriver::new(Arc::clone(&state), false));
        let tokens = Arc::new(TokenRegistry::new());
        let supervisor = SessionSupervisor::new(
            Arc::clone(&state),
            deriver,
            tokens,
            "http://127.0.0.1:4318".to_string(),
            LaunchMode::Standard,
            dir.path().join("notify"),
        );
        (state, supervisor, dir)
    }

    fn shell_params(session_id: &str, script: &str) -> StartSessionParams {
        StartSessionParams {
            session_id: session_id.to_string(),
            agent_type: Some(AgentType::Terminal),
            args: vec!["-c".to_string(), script.to_string()],
            ..StartSessionParams::default()
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails_session_already_exists() {
        let (_state, supervisor, _dir) = supervisor().await;
        supervisor
            .start_session(shell_params("conversation-1", "sleep 5"))
            .await
            .unwrap();
        let err = supervisor
            .start_session(shell_params("conversation-1", "sleep 5"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("session already exists"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_claim_conflict_and_takeover() {
        let (_state, supervisor, _dir) = supervisor().await;
        supervisor
            .start_session(shell_params("conversation-x", "sleep 5"))
            .await
            .unwrap();

        supervisor
            .claim_session(
                "conversation-x",
                "controller-a",
                ControllerType::Operator,
                Some("operator-a".into()),
                false,
            )
            .await
            .unwrap();

        let err = supervisor
            .claim_session(
                "conversation-x",
                "controller-b",
                ControllerType::Operator,
                None,
                false,
            )
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("session is already claimed by operator-a"),
            "{err}"
        );

        // Takeover replaces the lease.
        let controller = supervisor
            .claim_session(
                "conversation-x",
                "controller-b",
                ControllerType::Automation,
                Some("automation-b".into()),
                true,
            )
            .await
            .unwrap();
        assert_eq!(controller.label, "automation-b");
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_clears_lease() {
        let (_state, supervisor, _dir) = supervisor().await;
        supervisor
            .start_session(shell_params("conversation-r", "sleep 5"))
            .await
            .unwrap();
        supervisor
            .claim_session(
                "conversation-r",
                "controller-a",
                ControllerType::Operator,
                None,
                false,
            )
            .await
            .unwrap();
        supervisor
            .release_session("conversation-r", "controller-a")
            .await
            .unwrap();

        let view = supervisor.session_status("conversation-r").await.unwrap();
        assert!(view.controller.is_none());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_marks_session_exited_and_remove_clears_runtime() {
        let (state, supervisor, _dir) = supervisor().await;
        supervisor
            .start_session(shell_params("conversation-e", "exit 0"))
            .await
            .unwrap();

        // Wait for the exit to be recorded.
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
        loop {
            let convo = state.conversation("conversation-e").await.unwrap();
            if convo.runtime_status == RuntimeStatus::Exited {
                assert!(convo.runtime_last_exit.is_some());
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session never exited"
            );
            tokio::time::sleep(tokio::time::Duration::from_millis(25)).await;
        }

        supervisor.remove_session("conversation-e").await.unwrap();
        assert!(supervisor.session("conversation-e").await.is_none());
        // The durable conversation is not archived by removal.
        let convo = state.conversation("conversation-e").await.unwrap();
        assert!(convo.archived_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_session_operations_fail_not_found() {
        let (_state, supervisor, _dir) = supervisor().await;
        let err = supervisor
            .claim_session(
                "conversation-ghost",
                "controller-a",
                ControllerType::Operator,
                None,
                false,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conversation not found"));
    }
}
