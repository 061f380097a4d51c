//! Command dispatcher: one task per TCP connection, commands executed in
//! receipt order, replies and fan-out frames funneled through a single
//! writer task so frames never interleave.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::conversation::ControllerType;
use crate::protocol::command::Command;
use crate::protocol::event::{SessionEvent, StreamEventBody};
use crate::protocol::{ClientFrame, FrameDecoder, ServerFrame, encode_frame};
use crate::router::SubscriptionFilter;
use crate::server::Daemon;
use crate::store::TaskFilter;
use crate::supervisor::StartSessionParams;

/// Bound on the per-connection outbound frame queue.
const OUTBOUND_QUEUE_SIZE: usize = 1024;

struct ConnectionState {
    authenticated: bool,
    subscriptions: HashMap<Uuid, JoinHandle<()>>,
    attachments: Vec<(String, Uuid, JoinHandle<()>)>,
    event_sessions: Arc<std::sync::Mutex<HashSet<String>>>,
    tap_task: Option<JoinHandle<()>>,
}

impl ConnectionState {
    fn new(authenticated: bool) -> Self {
        Self {
            authenticated,
            subscriptions: HashMap::new(),
            attachments: Vec::new(),
            event_sessions: Arc::new(std::sync::Mutex::new(HashSet::new())),
            tap_task: None,
        }
    }
}

/// Handle one client connection until it closes.
///
/// # Errors
///
/// Returns an error on socket failure; normal disconnects return `Ok`.
pub async fn handle_connection(stream: TcpStream, daemon: Arc<Daemon>) -> anyhow::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE_SIZE);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(bytes) = encode_frame(&frame) else {
                continue;
            };
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnectionState::new(daemon.config.auth_token.is_none());
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];

    'outer: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        for frame in decoder.push::<ClientFrame>(&buf[..n]) {
            match frame {
                ClientFrame::Auth { token } => {
                    let expected = daemon.config.auth_token.as_deref();
                    if expected.is_none() || expected == Some(token.as_str()) {
                        conn.authenticated = true;
                        let _ = outbound_tx.send(ServerFrame::AuthOk).await;
                    } else {
                        let _ = outbound_tx
                            .send(ServerFrame::CommandFailed {
                                command_id: "auth".to_string(),
                                error: "invalid auth token".to_string(),
                            })
                            .await;
                        break 'outer;
                    }
                }
                frame if !conn.authenticated => {
                    tracing::warn!(?frame, "Dropping frame from unauthenticated connection");
                    break 'outer;
                }
                ClientFrame::Command {
                    command_id,
                    command,
                } => {
                    let _ = outbound_tx
                        .send(ServerFrame::CommandAccepted {
                            command_id: command_id.clone(),
                        })
                        .await;

                    // Executed inline so commands on this connection
                    // complete in submission order.
                    let reply =
                        match execute(&daemon, &mut conn, &outbound_tx, command).await {
                            Ok(result) => ServerFrame::CommandCompleted { command_id, result },
                            Err(e) => ServerFrame::CommandFailed {
                                command_id,
                                error: e.to_string(),
                            },
                        };
                    let _ = outbound_tx.send(reply).await;
                }
                ClientFrame::PtyInput {
                    session_id,
                    data_base64,
                } => match base64::prelude::BASE64_STANDARD.decode(&data_base64) {
                    Ok(bytes) => {
                        if let Err(e) = daemon.supervisor.write_input(&session_id, bytes).await {
                            tracing::warn!(session_id, error = %e, "PTY input dropped");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id, error = %e, "Dropping undecodable PTY input");
                    }
                },
                ClientFrame::PtyResize {
                    session_id,
                    cols,
                    rows,
                } => {
                    daemon.supervisor.resize(&session_id, cols, rows).await;
                }
                ClientFrame::PtySignal { session_id, signal } => {
                    if let Err(e) = daemon.supervisor.signal(&session_id, signal).await {
                        tracing::warn!(session_id, signal = signal.name(), error = %e, "Signal dropped");
                    }
                }
            }
        }
    }

    // Best-effort cleanup: drop this connection's subscriptions,
    // attachments, and tap.
    for (id, task) in conn.subscriptions.drain() {
        daemon.state.router().unsubscribe(id);
        task.abort();
    }
    for (session_id, attachment_id, task) in conn.attachments.drain(..) {
        daemon.supervisor.detach(&session_id, attachment_id).await;
        task.abort();
    }
    if let Some(task) = conn.tap_task.take() {
        task.abort();
    }
    drop(outbound_tx);
    let _ = writer_task.await;
    Ok(())
}

#[allow(clippy::too_many_lines)]
async fn execute(
    daemon: &Arc<Daemon>,
    conn: &mut ConnectionState,
    outbound: &mpsc::Sender<ServerFrame>,
    command: Command,
) -> anyhow::Result<serde_json::Value> {
    let state = &daemon.state;
    match command {
        // ── Directories ────────────────────────────────────────────────
        Command::DirectoryUpsert { directory_id, path } => {
            let directory = state.upsert_directory(directory_id, path).await?;
            Ok(serde_json::json!({ "directory": directory }))
        }
        Command::DirectoryArchive { directory_id } => {
            let directory = state.archive_directory(&directory_id).await?;
            Ok(serde_json::json!({ "directory": directory }))
        }
        Command::DirectoryList { include_archived } => {
            let directories = state.list_directories(include_archived).await?;
            Ok(serde_json::json!({ "directories": directories }))
        }
        Command::DirectoryGitStatus { directory_id } => {
            let snapshot = state.git_status(&directory_id).await?;
            Ok(serde_json::json!({ "snapshot": snapshot }))
        }

        // ── Repositories ───────────────────────────────────────────────
        Command::RepositoryUpsert {
            repository_id,
            name,
            remote_url,
            default_branch,
            metadata,
        } => {
            let repository = state
                .upsert_repository(repository_id, name, remote_url, default_branch, metadata)
                .await?;
            // Self-check on the reply shape before it goes out.
            if repository.id.is_empty() || repository.remote_url.is_empty() {
                anyhow::bail!("repository.upsert returned malformed repository");
            }
            Ok(serde_json::json!({ "repository": repository }))
        }
        Command::RepositoryGet { repository_id } => {
            let repository = state.repository(&repository_id).await?;
            Ok(serde_json::json!({ "repository": repository }))
        }
        Command::RepositoryUpdate {
            repository_id,
            patch,
        } => {
            let repository = state.update_repository(&repository_id, patch).await?;
            Ok(serde_json::json!({ "repository": repository }))
        }
        Command::RepositoryArchive { repository_id } => {
            let repository = state.archive_repository(&repository_id).await?;
            Ok(serde_json::json!({ "repository": repository }))
        }
        Command::RepositoryList { include_archived } => {
            let repositories = state.list_repositories(include_archived).await?;
            Ok(serde_json::json!({ "repositories": repositories }))
        }

        // ── Conversations ──────────────────────────────────────────────
        Command::ConversationCreate {
            conversation_id,
            directory_id,
            title,
            agent_type,
        } => {
            let conversation = state
                .create_conversation(
                    conversation_id,
                    directory_id,
                    title,
                    agent_type.unwrap_or_default(),
                )
                .await?;
            Ok(serde_json::json!({ "conversation": conversation }))
        }
        Command::ConversationUpdate {
            conversation_id,
            title,
            directory_id,
        } => {
            let conversation = state
                .update_conversation(&conversation_id, title, directory_id)
                .await?;
            Ok(serde_json::json!({ "conversation": conversation }))
        }
        Command::ConversationArchive { conversation_id } => {
            let conversation = state.archive_conversation(&conversation_id).await?;
            Ok(serde_json::json!({ "conversation": conversation }))
        }
        Command::ConversationDelete { conversation_id } => {
            state.delete_conversation(&conversation_id).await?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        Command::ConversationList {
            directory_id,
            include_archived,
        } => {
            let conversations = state
                .list_conversations(directory_id.as_deref(), include_archived)
                .await?;
            Ok(serde_json::json!({ "conversations": conversations }))
        }
        Command::ConversationTitleRefresh { conversation_id } => {
            let outcome = daemon.namer.refresh_title(&conversation_id).await?;
            Ok(serde_json::to_value(outcome)?)
        }

        // ── Tasks ──────────────────────────────────────────────────────
        Command::TaskCreate {
            task_id,
            title,
            body,
            repository_id,
            project_id,
            order_index,
            base_branch,
        } => {
            let task = state
                .create_task(
                    task_id,
                    title,
                    body,
                    repository_id,
                    project_id,
                    order_index,
                    base_branch,
                )
                .await?;
            Ok(serde_json::json!({ "task": task }))
        }
        Command::TaskUpdate {
            task_id,
            title,
            body,
            base_branch,
        } => {
            let task = state.update_task(&task_id, title, body, base_branch).await?;
            Ok(serde_json::json!({ "task": task }))
        }
        Command::TaskDelete { task_id } => {
            state.delete_task(&task_id).await?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        Command::TaskReady { task_id } => {
            let task = state
                .transition_task(&task_id, crate::core::TaskStatus::Ready)
                .await?;
            Ok(serde_json::json!({ "task": task }))
        }
        Command::TaskDraft { task_id } => {
            let task = state
                .transition_task(&task_id, crate::core::TaskStatus::Draft)
                .await?;
            Ok(serde_json::json!({ "task": task }))
        }
        Command::TaskQueue { task_id } => {
            let task = state
                .transition_task(&task_id, crate::core::TaskStatus::Ready)
                .await?;
            Ok(serde_json::json!({ "task": task }))
        }
        Command::TaskComplete { task_id } => {
            let task = state
                .transition_task(&task_id, crate::core::TaskStatus::Completed)
                .await?;
            Ok(serde_json::json!({ "task": task }))
        }
        Command::TaskClaim {
            task_id,
            controller_id,
            directory_id,
            branch_name,
            base_branch,
        } => {
            let task = state
                .claim_task(
                    &task_id,
                    &controller_id,
                    directory_id.as_deref(),
                    branch_name.as_deref(),
                    base_branch.as_deref(),
                )
                .await?;
            Ok(serde_json::json!({ "task": task }))
        }
        Command::TaskPull {
            controller_id,
            directory_id,
            repository_id,
        } => {
            let outcome = state
                .pull_task(
                    &controller_id,
                    directory_id.as_deref(),
                    repository_id.as_deref(),
                )
                .await?;
            Ok(serde_json::to_value(outcome)?)
        }
        Command::TaskReorder { task_ids } => {
            let tasks = state.reorder_tasks(&task_ids).await?;
            Ok(serde_json::json!({ "tasks": tasks }))
        }
        Command::TaskList {
            status,
            repository_id,
            project_id,
        } => {
            let filter = TaskFilter {
                status: status.as_deref().map(str::parse).transpose()?,
                repository_id,
                project_id,
            };
            let tasks = state.list_tasks(&filter).await?;
            Ok(serde_json::json!({ "tasks": tasks }))
        }
        Command::TaskGet { task_id } => {
            let task = state.task(&task_id).await?;
            Ok(serde_json::json!({ "task": task }))
        }

        // ── Project settings & policies ────────────────────────────────
        Command::ProjectSettingsGet { directory_id } => {
            let settings = state.project_settings(&directory_id).await?;
            Ok(serde_json::json!({ "settings": settings }))
        }
        Command::ProjectSettingsUpdate {
            directory_id,
            pinned_branch,
            task_focus_mode,
            thread_spawn_mode,
        } => {
            let settings = state
                .update_project_settings(
                    &directory_id,
                    Some(pinned_branch),
                    task_focus_mode,
                    thread_spawn_mode,
                )
                .await?;
            Ok(serde_json::json!({ "settings": settings }))
        }
        Command::ProjectStatus { directory_id } => {
            let directory = state.directory(&directory_id).await.map_err(|_| {
                anyhow::anyhow!("project not found: {directory_id}")
            })?;
            let settings = state.project_settings(&directory_id).await?;
            let policy = state.effective_policy(&directory).await?;
            let git_status = state.git_status(&directory_id).await.ok();
            Ok(serde_json::json!({
                "settings": settings,
                "policy": policy,
                "gitStatus": git_status,
            }))
        }
        Command::AutomationPolicyGet { scope, scope_id } => {
            let policy = state.policy(scope, scope_id.as_deref()).await?;
            Ok(serde_json::json!({ "policy": policy }))
        }
        Command::AutomationPolicySet {
            scope,
            scope_id,
            automation_enabled,
            frozen,
        } => {
            let policy = state
                .set_policy(scope, scope_id.as_deref(), automation_enabled, frozen)
                .await?;
            Ok(serde_json::json!({ "policy": policy }))
        }

        // ── Sessions ───────────────────────────────────────────────────
        Command::SessionStatus { session_id } => {
            let view = daemon.supervisor.session_status(&session_id).await?;
            Ok(serde_json::json!({ "session": view }))
        }
        Command::SessionList {} => {
            let sessions = daemon.supervisor.list_sessions().await;
            Ok(serde_json::json!({ "sessions": sessions }))
        }
        Command::SessionClaim {
            session_id,
            controller_id,
            controller_type,
            controller_label,
        } => {
            let controller = daemon
                .supervisor
                .claim_session(
                    &session_id,
                    &controller_id,
                    controller_type.unwrap_or(ControllerType::Operator),
                    controller_label,
                    false,
                )
                .await?;
            Ok(serde_json::json!({ "controller": controller }))
        }
        Command::SessionTakeover {
            session_id,
            controller_id,
            controller_type,
            controller_label,
        } => {
            let controller = daemon
                .supervisor
                .claim_session(
                    &session_id,
                    &controller_id,
                    controller_type.unwrap_or(ControllerType::Operator),
                    controller_label,
                    true,
                )
                .await?;
            Ok(serde_json::json!({ "controller": controller }))
        }
        Command::SessionRelease {
            session_id,
            controller_id,
        } => {
            daemon
                .supervisor
                .release_session(&session_id, &controller_id)
                .await?;
            Ok(serde_json::json!({ "released": true }))
        }
        Command::SessionRespond { session_id, text } => {
            daemon.supervisor.respond(&session_id, &text).await?;
            Ok(serde_json::json!({ "responded": true }))
        }
        Command::SessionInterrupt { session_id } => {
            daemon
                .supervisor
                .signal(&session_id, crate::protocol::SignalKind::Int)
                .await?;
            Ok(serde_json::json!({ "interrupted": true }))
        }
        Command::SessionRemove { session_id } => {
            daemon.supervisor.remove_session(&session_id).await?;
            Ok(serde_json::json!({ "removed": true }))
        }

        // ── PTY ────────────────────────────────────────────────────────
        Command::PtyStart {
            session_id,
            agent_type,
            args,
            env,
            cwd,
            initial_cols,
            initial_rows,
            launch_mode,
            telemetry,
        } => {
            let view = daemon
                .supervisor
                .start_session(StartSessionParams {
                    session_id,
                    agent_type,
                    args,
                    env,
                    cwd,
                    initial_cols,
                    initial_rows,
                    launch_mode: launch_mode.as_deref().map(str::parse).transpose()?,
                    telemetry,
                })
                .await?;
            Ok(serde_json::json!({ "session": view }))
        }
        Command::PtyAttach {
            session_id,
            since_cursor,
        } => {
            let (attachment_id, replay, mut live_rx) =
                daemon.supervisor.attach(&session_id, since_cursor).await?;

            let outbound = outbound.clone();
            let session = session_id.clone();
            let task = tokio::spawn(async move {
                let mut last_sent = 0u64;
                for chunk in replay {
                    last_sent = last_sent.max(chunk.cursor);
                    let frame = ServerFrame::PtyOutput {
                        session_id: session.clone(),
                        cursor: chunk.cursor,
                        chunk_base64: base64::prelude::BASE64_STANDARD.encode(&chunk.bytes),
                    };
                    if outbound.send(frame).await.is_err() {
                        return;
                    }
                }
                loop {
                    match live_rx.recv().await {
                        Ok(chunk) => {
                            // The ring snapshot may overlap the live feed.
                            if chunk.cursor <= last_sent {
                                continue;
                            }
                            last_sent = chunk.cursor;
                            let frame = ServerFrame::PtyOutput {
                                session_id: session.clone(),
                                cursor: chunk.cursor,
                                chunk_base64: base64::prelude::BASE64_STANDARD
                                    .encode(&chunk.bytes),
                            };
                            if outbound.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            conn.attachments.push((session_id, attachment_id, task));
            Ok(serde_json::json!({ "attachmentId": attachment_id.to_string() }))
        }
        Command::PtyDetach {
            session_id,
            attachment_id,
        } => {
            let target: Option<Uuid> = attachment_id.as_deref().map(str::parse).transpose()?;
            let mut kept = Vec::new();
            for (sid, aid, task) in conn.attachments.drain(..) {
                let matches = sid == session_id && target.is_none_or(|t| t == aid);
                if matches {
                    daemon.supervisor.detach(&sid, aid).await;
                    task.abort();
                } else {
                    kept.push((sid, aid, task));
                }
            }
            conn.attachments = kept;
            Ok(serde_json::json!({ "detached": true }))
        }
        Command::PtySubscribeEvents { session_id } => {
            conn.event_sessions
                .lock()
                .map_err(|_| anyhow::anyhow!("event subscription state poisoned"))?
                .insert(session_id);
            ensure_event_tap(daemon, conn, outbound);
            Ok(serde_json::json!({ "subscribed": true }))
        }
        Command::PtyUnsubscribeEvents { session_id } => {
            conn.event_sessions
                .lock()
                .map_err(|_| anyhow::anyhow!("event subscription state poisoned"))?
                .remove(&session_id);
            Ok(serde_json::json!({ "subscribed": false }))
        }
        Command::PtyClose { session_id } => {
            daemon.supervisor.close_session(&session_id).await?;
            Ok(serde_json::json!({ "closed": true }))
        }

        // ── Stream ─────────────────────────────────────────────────────
        Command::StreamSubscribe {
            repository_id,
            task_id,
            directory_id,
            conversation_id,
            include_output,
            after_cursor,
        } => {
            let filter = SubscriptionFilter {
                scope: daemon.state.scope().clone(),
                repository_id,
                task_id,
                directory_id,
                conversation_id,
            };
            let (id, cursor, mut rx) =
                daemon
                    .state
                    .router()
                    .subscribe(filter, include_output, after_cursor);

            let outbound = outbound.clone();
            let task = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if outbound.send(frame).await.is_err() {
                        break;
                    }
                }
            });
            conn.subscriptions.insert(id, task);
            Ok(serde_json::json!({
                "subscriptionId": format!("subscription-{id}"),
                "cursor": cursor,
            }))
        }
        Command::StreamUnsubscribe { subscription_id } => {
            let id = subscription_id
                .strip_prefix("subscription-")
                .and_then(|raw| raw.parse::<Uuid>().ok())
                .ok_or_else(|| anyhow::anyhow!("malformed subscription id: {subscription_id}"))?;
            let removed = daemon.state.router().unsubscribe(id);
            if let Some(task) = conn.subscriptions.remove(&id) {
                task.abort();
            }
            Ok(serde_json::json!({ "removed": removed }))
        }

        // ── GitHub ─────────────────────────────────────────────────────
        Command::GithubPrCreate {
            directory_id,
            title,
            body,
            base,
            head,
        } => {
            let directory = state.directory(&directory_id).await?;
            let repository_id = directory
                .repository_id
                .clone()
                .ok_or_else(|| anyhow::anyhow!("repository not found: {directory_id}"))?;
            let repository = state.repository(&repository_id).await?;
            let base = base.unwrap_or_else(|| repository.default_branch.clone());
            let pr = daemon
                .github
                .create_pr(&repository.remote_url, &head, &base, &title, &body)
                .await?;
            Ok(serde_json::json!({ "pr": pr }))
        }
        Command::GithubProjectPr { directory_id } => {
            let directory = state.directory(&directory_id).await?;
            let repository_id = directory
                .repository_id
                .clone()
                .ok_or_else(|| anyhow::anyhow!("repository not found: {directory_id}"))?;
            let repository = state.repository(&repository_id).await?;
            let snapshot = state.git_status(&directory_id).await?;
            let branch = snapshot
                .branch
                .ok_or_else(|| anyhow::anyhow!("directory has no checked-out branch"))?;
            let pr = daemon
                .github
                .find_open_pr(&repository.remote_url, &branch)
                .await?;
            Ok(serde_json::json!({ "pr": pr }))
        }
    }
}

/// Start (once per connection) the tap that converts session events for
/// subscribed sessions into `pty.event` / `pty.exit` envelopes.
fn ensure_event_tap(
    daemon: &Arc<Daemon>,
    conn: &mut ConnectionState,
    outbound: &mpsc::Sender<ServerFrame>,
) {
    if conn.tap_task.is_some() {
        return;
    }
    let mut tap = daemon.state.router().register_tap();
    let sessions = Arc::clone(&conn.event_sessions);
    let outbound = outbound.clone();

    conn.tap_task = Some(tokio::spawn(async move {
        while let Some(scoped) = tap.recv().await {
            let StreamEventBody::SessionEvent { session_id, event } = scoped.body else {
                continue;
            };
            let subscribed = sessions
                .lock()
                .map(|set| set.contains(&session_id))
                .unwrap_or(false);
            if !subscribed {
                continue;
            }

            let frame = match &event {
                SessionEvent::SessionExit { exit } => ServerFrame::PtyExit {
                    session_id: session_id.clone(),
                    exit: exit.clone(),
                },
                SessionEvent::Notify { .. } => ServerFrame::PtyEvent {
                    session_id: session_id.clone(),
                    event,
                },
            };
            if outbound.send(frame).await.is_err() {
                break;
            }
        }
    }));
}
