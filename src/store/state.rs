use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Store, StoreError, TaskFilter};
use crate::core::conversation::{AgentType, Conversation};
use crate::core::directory::{Directory, GitStatusSnapshot};
use crate::core::policy::{AutomationPolicy, PolicyScope, ProjectSettings, TaskFocusMode};
use crate::core::repository::{Repository, normalize_remote_url};
use crate::core::scope::Scope;
use crate::core::task::{Task, TaskStatus};
use crate::protocol::command::RepositoryPatch;
use crate::protocol::event::{EventScope, StreamEventBody};
use crate::router::SubscriptionRouter;

/// How long a git status snapshot stays fresh before a re-read.
const GIT_STATUS_TTL_MS: i64 = 5_000;

/// Single-writer facade over the durable [`Store`].
///
/// Every mutating operation runs under the write lock and, in order:
/// persists the row change, allocates the next global cursor by publishing
/// the typed event, and appends the event to the durable log. The reply is
/// not sent until all three are done.
pub struct StateStore {
    store: Arc<dyn Store>,
    router: Arc<SubscriptionRouter>,
    scope: Scope,
    write_lock: Mutex<()>,
    git_cache: Mutex<HashMap<String, GitStatusSnapshot>>,
}

/// Result of a `task.pull`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPullOutcome {
    /// The claimed task, when one was found.
    pub task: Option<PulledTask>,

    /// Directory-level block that prevented a pull, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,

    /// Why no task was returned when not blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Pulled-task projection returned by `task.pull`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledTask {
    /// Claimed task id.
    pub task_id: String,

    /// Task title.
    pub title: String,

    /// Task body.
    pub body: String,

    /// Work branch, when assigned.
    pub branch_name: Option<String>,

    /// Base branch, when assigned.
    pub base_branch: Option<String>,

    /// Directory the claim bound to.
    pub directory_id: Option<String>,
}

impl From<&Task> for PulledTask {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            body: task.body.clone(),
            branch_name: task.branch_name.clone(),
            base_branch: task.base_branch.clone(),
            directory_id: task.claimed_by_directory_id.clone(),
        }
    }
}

impl StateStore {
    /// Build the facade over a store and router.
    pub fn new(store: Arc<dyn Store>, router: Arc<SubscriptionRouter>, scope: Scope) -> Self {
        Self {
            store,
            router,
            scope,
            write_lock: Mutex::new(()),
            git_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The daemon's default scope.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The fan-out router events are published into.
    #[must_use]
    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.router
    }

    /// Publish an event and append it to the durable log.
    pub async fn emit(&self, scope: EventScope, body: StreamEventBody) -> u64 {
        let cursor = self.router.publish(scope.clone(), body.clone());
        let scope_json = serde_json::to_value(&scope).unwrap_or_default();
        let body_json = serde_json::to_value(&body).unwrap_or_default();
        if let Err(e) = self.store.record_event(cursor, &scope_json, &body_json).await {
            tracing::warn!(error = %e, cursor, "Failed to append event to durable log");
        }
        cursor
    }

    // ── Directories ────────────────────────────────────────────────────

    /// Register or update a directory. Idempotent on (scope, path).
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn upsert_directory(
        &self,
        directory_id: Option<String>,
        path: String,
    ) -> Result<Directory, StoreError> {
        let _guard = self.write_lock.lock().await;

        let existing = match &directory_id {
            Some(id) => self.store.get_directory(id).await?,
            None => self.store.find_directory_by_path(&self.scope, &path).await?,
        };

        let directory = match existing {
            Some(mut dir) => {
                dir.path = path;
                dir.archived_at = None;
                dir
            }
            None => Directory {
                id: directory_id.unwrap_or_else(|| format!("directory-{}", Uuid::new_v4())),
                scope: self.scope.clone(),
                path,
                repository_id: None,
                created_at: Utc::now(),
                archived_at: None,
            },
        };

        self.store.save_directory(&directory).await?;
        self.emit(
            EventScope::directory(self.scope.clone(), &directory.id),
            StreamEventBody::DirectoryUpdated {
                directory: directory.clone(),
            },
        )
        .await;
        Ok(directory)
    }

    /// Archive a directory.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn archive_directory(&self, directory_id: &str) -> Result<Directory, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut directory = self
            .store
            .get_directory(directory_id)
            .await?
            .ok_or_else(|| StoreError::not_found("directory", directory_id))?;
        directory.archived_at = Some(Utc::now());
        self.store.save_directory(&directory).await?;
        self.emit(
            EventScope::directory(self.scope.clone(), directory_id),
            StreamEventBody::DirectoryArchived {
                directory_id: directory_id.to_string(),
            },
        )
        .await;
        Ok(directory)
    }

    /// List directories in scope.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn list_directories(
        &self,
        include_archived: bool,
    ) -> Result<Vec<Directory>, StoreError> {
        self.store.list_directories(&self.scope, include_archived).await
    }

    /// Fetch a directory, mapping missing rows to NotFound.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn directory(&self, directory_id: &str) -> Result<Directory, StoreError> {
        self.store
            .get_directory(directory_id)
            .await?
            .ok_or_else(|| StoreError::not_found("directory", directory_id))
    }

    /// Read the git status snapshot for a directory, refreshing when stale.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown directories.
    pub async fn git_status(&self, directory_id: &str) -> Result<GitStatusSnapshot, StoreError> {
        let directory = self.directory(directory_id).await?;

        {
            let cache = self.git_cache.lock().await;
            if let Some(snapshot) = cache.get(directory_id) {
                let age = Utc::now().timestamp_millis() - snapshot.last_refreshed_at_ms;
                if age < GIT_STATUS_TTL_MS {
                    return Ok(snapshot.clone());
                }
            }
        }

        let snapshot = self.refresh_git_status(&directory).await;
        self.git_cache
            .lock()
            .await
            .insert(directory_id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Peek the cached snapshot without refreshing. Used by the task pull
    /// path so a pull never shells out to git.
    pub async fn cached_git_status(&self, directory_id: &str) -> Option<GitStatusSnapshot> {
        self.git_cache.lock().await.get(directory_id).cloned()
    }

    async fn refresh_git_status(&self, directory: &Directory) -> GitStatusSnapshot {
        let mut snapshot = GitStatusSnapshot {
            last_refreshed_at_ms: Utc::now().timestamp_millis(),
            ..GitStatusSnapshot::default()
        };

        async fn run(cwd: &str, args: &[&str]) -> std::io::Result<std::process::Output> {
            let mut cmd = tokio::process::Command::new("git");
            cmd.args(args).current_dir(cwd);
            cmd.output().await
        }
        let cwd = directory.path.as_str();

        if let Ok(out) = run(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
            if out.status.success() {
                snapshot.branch = Some(String::from_utf8_lossy(&out.stdout).trim().to_string());
            }
        }
        if let Ok(out) = run(cwd, &["status", "--porcelain"]).await {
            if out.status.success() {
                snapshot.changed_files = u32::try_from(
                    String::from_utf8_lossy(&out.stdout)
                        .lines()
                        .filter(|l| !l.is_empty())
                        .count(),
                )
                .unwrap_or(u32::MAX);
            }
        }
        if let Ok(out) = run(cwd, &["diff", "--numstat"]).await {
            if out.status.success() {
                for line in String::from_utf8_lossy(&out.stdout).lines() {
                    let mut parts = line.split_whitespace();
                    snapshot.additions += parts
                        .next()
                        .and_then(|s| s.parse::<u32>().ok())
                        .unwrap_or(0);
                    snapshot.deletions += parts
                        .next()
                        .and_then(|s| s.parse::<u32>().ok())
                        .unwrap_or(0);
                }
            }
        }
        if let Ok(out) = run(cwd, &["remote", "get-url", "origin"]).await {
            if out.status.success() {
                let remote =
                    normalize_remote_url(String::from_utf8_lossy(&out.stdout).trim());
                if let Ok(Some(repo)) = self
                    .store
                    .find_repository_by_remote(&self.scope, &remote)
                    .await
                {
                    snapshot.repository_id = Some(repo.id.clone());
                    // Remember the association for pull fan-out.
                    if directory.repository_id.as_deref() != Some(repo.id.as_str()) {
                        let mut updated = directory.clone();
                        updated.repository_id = Some(repo.id);
                        let _ = self.store.save_directory(&updated).await;
                    }
                }
                snapshot.repository_snapshot = Some(remote);
            }
        }

        snapshot
    }

    // ── Repositories ───────────────────────────────────────────────────

    /// Register or update a repository. The normalized remote URL is the
    /// stable identity; upserting the same remote twice updates in place.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn upsert_repository(
        &self,
        repository_id: Option<String>,
        name: String,
        remote_url: String,
        default_branch: Option<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Repository, StoreError> {
        let _guard = self.write_lock.lock().await;
        let normalized = normalize_remote_url(&remote_url);

        let existing = match &repository_id {
            Some(id) => self.store.get_repository(id).await?,
            None => {
                self.store
                    .find_repository_by_remote(&self.scope, &normalized)
                    .await?
            }
        };

        let repository = match existing {
            Some(mut repo) => {
                repo.name = name;
                if let Some(branch) = default_branch {
                    repo.default_branch = branch;
                }
                for (key, value) in metadata {
                    repo.metadata.insert(key, value);
                }
                repo
            }
            None => Repository {
                id: repository_id.unwrap_or_else(|| format!("repository-{}", Uuid::new_v4())),
                scope: self.scope.clone(),
                name,
                remote_url: normalized,
                default_branch: default_branch.unwrap_or_else(|| "main".to_string()),
                metadata,
                created_at: Utc::now(),
                archived_at: None,
            },
        };

        self.store.save_repository(&repository).await?;
        self.emit(
            EventScope::repository(self.scope.clone(), &repository.id),
            StreamEventBody::RepositoryUpdated {
                repository: repository.clone(),
            },
        )
        .await;
        Ok(repository)
    }

    /// Fetch a repository.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn repository(&self, repository_id: &str) -> Result<Repository, StoreError> {
        self.store
            .get_repository(repository_id)
            .await?
            .ok_or_else(|| StoreError::not_found("repository", repository_id))
    }

    /// Patch an existing repository.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn update_repository(
        &self,
        repository_id: &str,
        patch: RepositoryPatch,
    ) -> Result<Repository, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut repository = self
            .store
            .get_repository(repository_id)
            .await?
            .ok_or_else(|| StoreError::not_found("repository", repository_id))?;

        if let Some(name) = patch.name {
            repository.name = name;
        }
        if let Some(branch) = patch.default_branch {
            repository.default_branch = branch;
        }
        if let Some(metadata) = patch.metadata {
            for (key, value) in metadata {
                if value.is_null() {
                    repository.metadata.remove(&key);
                } else {
                    repository.metadata.insert(key, value);
                }
            }
        }

        self.store.save_repository(&repository).await?;
        self.emit(
            EventScope::repository(self.scope.clone(), repository_id),
            StreamEventBody::RepositoryUpdated {
                repository: repository.clone(),
            },
        )
        .await;
        Ok(repository)
    }

    /// Archive a repository.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn archive_repository(&self, repository_id: &str) -> Result<Repository, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut repository = self
            .store
            .get_repository(repository_id)
            .await?
            .ok_or_else(|| StoreError::not_found("repository", repository_id))?;
        repository.archived_at = Some(Utc::now());
        self.store.save_repository(&repository).await?;
        self.emit(
            EventScope::repository(self.scope.clone(), repository_id),
            StreamEventBody::RepositoryArchived {
                repository_id: repository_id.to_string(),
            },
        )
        .await;
        Ok(repository)
    }

    /// List repositories in scope.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn list_repositories(
        &self,
        include_archived: bool,
    ) -> Result<Vec<Repository>, StoreError> {
        self.store.list_repositories(&self.scope, include_archived).await
    }

    // ── Conversations ──────────────────────────────────────────────────

    /// Create a thread.
    ///
    /// # Errors
    ///
    /// Fails when the id already exists.
    pub async fn create_conversation(
        &self,
        conversation_id: Option<String>,
        directory_id: Option<String>,
        title: Option<String>,
        agent_type: AgentType,
    ) -> Result<Conversation, StoreError> {
        let _guard = self.write_lock.lock().await;
        let id = conversation_id.unwrap_or_else(|| format!("conversation-{}", Uuid::new_v4()));

        if self.store.get_conversation(&id).await?.is_some() {
            return Err(StoreError::Validation(format!(
                "conversation already exists: {id}"
            )));
        }
        if let Some(dir) = &directory_id {
            if self.store.get_directory(dir).await?.is_none() {
                return Err(StoreError::not_found("directory", dir));
            }
        }

        let mut conversation = Conversation::new(
            id,
            self.scope.clone(),
            agent_type,
            title.unwrap_or_else(|| "untitled".to_string()),
        );
        conversation.directory_id = directory_id;

        self.store.save_conversation(&conversation).await?;
        self.emit(
            EventScope::conversation(
                self.scope.clone(),
                &conversation.id,
                conversation.directory_id.as_deref(),
            ),
            StreamEventBody::ConversationCreated {
                conversation: conversation.clone(),
            },
        )
        .await;
        Ok(conversation)
    }

    /// Fetch a thread.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn conversation(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id))
    }

    /// Update a thread's title or directory binding.
    ///
    /// Archived threads accept the write but emit nothing; they are inert
    /// for fan-out.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn update_conversation(
        &self,
        conversation_id: &str,
        title: Option<String>,
        directory_id: Option<String>,
    ) -> Result<Conversation, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;

        if let Some(title) = title {
            conversation.title = title;
        }
        if let Some(dir) = directory_id {
            conversation.directory_id = Some(dir);
        }
        self.store.save_conversation(&conversation).await?;

        if !conversation.is_archived() {
            self.emit(
                EventScope::conversation(
                    self.scope.clone(),
                    conversation_id,
                    conversation.directory_id.as_deref(),
                ),
                StreamEventBody::ConversationUpdated {
                    conversation: conversation.clone(),
                },
            )
            .await;
        }
        Ok(conversation)
    }

    /// Persist a conversation's runtime fields without emitting fan-out.
    /// The status deriver emits `session-status` separately.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn persist_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.save_conversation(conversation).await
    }

    /// Archive a thread. The archive event itself is the last event that
    /// will ever reference it.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn archive_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Conversation, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;
        let was_archived = conversation.is_archived();
        conversation.archived_at = Some(Utc::now());
        self.store.save_conversation(&conversation).await?;

        if !was_archived {
            self.emit(
                EventScope::conversation(
                    self.scope.clone(),
                    conversation_id,
                    conversation.directory_id.as_deref(),
                ),
                StreamEventBody::ConversationArchived {
                    conversation_id: conversation_id.to_string(),
                },
            )
            .await;
        }
        Ok(conversation)
    }

    /// Delete a thread.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;
        self.store.delete_conversation(conversation_id).await?;

        if !conversation.is_archived() {
            self.emit(
                EventScope::conversation(
                    self.scope.clone(),
                    conversation_id,
                    conversation.directory_id.as_deref(),
                ),
                StreamEventBody::ConversationDeleted {
                    conversation_id: conversation_id.to_string(),
                },
            )
            .await;
        }
        Ok(())
    }

    /// List threads.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn list_conversations(
        &self,
        directory_id: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.store
            .list_conversations(&self.scope, directory_id, include_archived)
            .await
    }

    /// Merge an observed provider thread id into the conversation's own
    /// adapter slot. No-op for archived threads, terminal threads, or when
    /// the observed agent does not match the thread's agent.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn merge_provider_thread_id(
        &self,
        conversation_id: &str,
        observed_agent: AgentType,
        provider_thread_id: &str,
        observed_at: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut conversation) = self.store.get_conversation(conversation_id).await? else {
            return Ok(());
        };
        if conversation.is_archived() || conversation.agent_type != observed_agent {
            return Ok(());
        }
        let Some(slot) = conversation.own_adapter_slot() else {
            return Ok(());
        };
        slot.resume_session_id = Some(provider_thread_id.to_string());
        slot.last_observed_at = Some(observed_at);
        self.store.save_conversation(&conversation).await
    }

    /// Set a thread title, emitting `conversation-updated` when it changed.
    /// Returns whether the stored title changed.
    ///
    /// # Errors
    ///
    /// Fails with NotFound (as `thread not found`) for unknown ids.
    pub async fn set_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::not_found("thread", conversation_id))?;
        if conversation.title == title {
            return Ok(false);
        }
        conversation.title = title.to_string();
        self.store.save_conversation(&conversation).await?;
        if !conversation.is_archived() {
            self.emit(
                EventScope::conversation(
                    self.scope.clone(),
                    conversation_id,
                    conversation.directory_id.as_deref(),
                ),
                StreamEventBody::ConversationUpdated {
                    conversation: conversation.clone(),
                },
            )
            .await;
        }
        Ok(true)
    }

    // ── Tasks ──────────────────────────────────────────────────────────

    /// Create a draft task, appended to the end of the order unless an
    /// explicit index is given.
    ///
    /// # Errors
    ///
    /// Fails when the id already exists.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        task_id: Option<String>,
        title: String,
        body: String,
        repository_id: Option<String>,
        project_id: Option<String>,
        order_index: Option<i64>,
        base_branch: Option<String>,
    ) -> Result<Task, StoreError> {
        let _guard = self.write_lock.lock().await;
        let id = task_id.unwrap_or_else(|| format!("task-{}", Uuid::new_v4()));
        if self.store.get_task(&id).await?.is_some() {
            return Err(StoreError::Validation(format!("task already exists: {id}")));
        }

        let order_index = match order_index {
            Some(index) => index,
            None => self.store.max_task_order_index(&self.scope).await? + 1,
        };

        let mut task = Task::new(id, self.scope.clone(), title, body, order_index);
        task.repository_id = repository_id;
        task.project_id = project_id;
        task.base_branch = base_branch;

        self.store.save_task(&task).await?;
        self.emit_task_updated(&task).await;
        Ok(task)
    }

    /// Fetch a task.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn task(&self, task_id: &str) -> Result<Task, StoreError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }

    /// Update task fields.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn update_task(
        &self,
        task_id: &str,
        title: Option<String>,
        body: Option<String>,
        base_branch: Option<String>,
    ) -> Result<Task, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        if let Some(title) = title {
            task.title = title;
        }
        if let Some(body) = body {
            task.body = body;
        }
        if let Some(base) = base_branch {
            task.base_branch = Some(base);
        }
        task.updated_at = Utc::now();
        self.store.save_task(&task).await?;
        self.emit_task_updated(&task).await;
        Ok(task)
    }

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        self.store.delete_task(task_id).await?;
        self.emit(
            EventScope::task(self.scope.clone(), &task),
            StreamEventBody::TaskDeleted {
                task_id: task_id.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Move a task to a new status, releasing the claim when leaving
    /// in-progress.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids.
    pub async fn transition_task(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Task, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;

        if matches!(status, TaskStatus::Draft | TaskStatus::Ready) {
            task.release_claim();
        }
        task.status = status;
        task.updated_at = Utc::now();
        self.store.save_task(&task).await?;
        self.emit_task_updated(&task).await;
        Ok(task)
    }

    /// Claim a specific task for a controller.
    ///
    /// # Errors
    ///
    /// Fails with NotFound for unknown ids and AlreadyClaimed when the task
    /// is not ready/unclaimed.
    pub async fn claim_task(
        &self,
        task_id: &str,
        controller_id: &str,
        directory_id: Option<&str>,
        branch_name: Option<&str>,
        base_branch: Option<&str>,
    ) -> Result<Task, StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.store.get_task(task_id).await?.is_none() {
            return Err(StoreError::not_found("task", task_id));
        }
        let claimed = self
            .store
            .try_claim_task(task_id, controller_id, directory_id, branch_name, base_branch)
            .await?
            .ok_or_else(|| StoreError::AlreadyClaimed {
                task_id: task_id.to_string(),
            })?;
        self.emit_task_updated(&claimed).await;
        Ok(claimed)
    }

    /// Reorder tasks: ids are assigned ascending order indexes by position.
    ///
    /// # Errors
    ///
    /// Fails with NotFound when any id is unknown.
    pub async fn reorder_tasks(&self, task_ids: &[String]) -> Result<Vec<Task>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut reordered = Vec::with_capacity(task_ids.len());
        for (position, task_id) in task_ids.iter().enumerate() {
            let mut task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or_else(|| StoreError::not_found("task", task_id))?;
            task.order_index = i64::try_from(position).unwrap_or(i64::MAX);
            task.updated_at = Utc::now();
            self.store.save_task(&task).await?;
            self.emit_task_updated(&task).await;
            reordered.push(task);
        }
        Ok(reordered)
    }

    /// List tasks.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.store.list_tasks(&self.scope, filter).await
    }

    async fn emit_task_updated(&self, task: &Task) {
        self.emit(
            EventScope::task(self.scope.clone(), task),
            StreamEventBody::TaskUpdated { task: task.clone() },
        )
        .await;
    }

    // ── Policies & settings ────────────────────────────────────────────

    /// Read the policy at a scope, defaulting to permissive.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn policy(
        &self,
        scope_level: PolicyScope,
        scope_id: Option<&str>,
    ) -> Result<AutomationPolicy, StoreError> {
        Ok(self
            .store
            .get_policy(scope_level, scope_id)
            .await?
            .unwrap_or_else(|| {
                AutomationPolicy::permissive(scope_level, scope_id.map(ToString::to_string))
            }))
    }

    /// Write the policy at a scope, merging into the existing row.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn set_policy(
        &self,
        scope_level: PolicyScope,
        scope_id: Option<&str>,
        automation_enabled: Option<bool>,
        frozen: Option<bool>,
    ) -> Result<AutomationPolicy, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut policy = self
            .store
            .get_policy(scope_level, scope_id)
            .await?
            .unwrap_or_else(|| {
                AutomationPolicy::permissive(scope_level, scope_id.map(ToString::to_string))
            });
        if let Some(enabled) = automation_enabled {
            policy.automation_enabled = enabled;
        }
        if let Some(frozen) = frozen {
            policy.frozen = frozen;
        }
        self.store.save_policy(&policy).await?;
        Ok(policy)
    }

    /// Effective policy for a directory: repository > project > global,
    /// taking the most specific row that exists.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub async fn effective_policy(
        &self,
        directory: &Directory,
    ) -> Result<AutomationPolicy, StoreError> {
        if let Some(repo) = &directory.repository_id {
            if let Some(policy) = self
                .store
                .get_policy(PolicyScope::Repository, Some(repo))
                .await?
            {
                return Ok(policy);
            }
        }
        if let Some(policy) = self
            .store
            .get_policy(PolicyScope::Project, Some(&directory.id))
            .await?
        {
            return Ok(policy);
        }
        self.policy(PolicyScope::Global, None).await
    }

    /// Read a directory's project settings (defaults when unset).
    ///
    /// # Errors
    ///
    /// Fails with `project not found` for unknown directories.
    pub async fn project_settings(&self, directory_id: &str) -> Result<ProjectSettings, StoreError> {
        if self.store.get_directory(directory_id).await?.is_none() {
            return Err(StoreError::not_found("project", directory_id));
        }
        Ok(self
            .store
            .get_project_settings(directory_id)
            .await?
            .unwrap_or_default())
    }

    /// Update a directory's project settings.
    ///
    /// # Errors
    ///
    /// Fails with `project not found` for unknown directories.
    pub async fn update_project_settings(
        &self,
        directory_id: &str,
        pinned_branch: Option<Option<String>>,
        task_focus_mode: Option<TaskFocusMode>,
        thread_spawn_mode: Option<crate::core::ThreadSpawnMode>,
    ) -> Result<ProjectSettings, StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.store.get_directory(directory_id).await?.is_none() {
            return Err(StoreError::not_found("project", directory_id));
        }
        let mut settings = self
            .store
            .get_project_settings(directory_id)
            .await?
            .unwrap_or_default();
        if let Some(pinned) = pinned_branch {
            settings.pinned_branch = pinned;
        }
        if let Some(mode) = task_focus_mode {
            settings.task_focus_mode = mode;
        }
        if let Some(mode) = thread_spawn_mode {
            settings.thread_spawn_mode = mode;
        }
        self.store
            .save_project_settings(directory_id, &settings)
            .await?;
        Ok(settings)
    }

    // ── Task pull ──────────────────────────────────────────────────────

    /// Pick and claim exactly one ready task for a controller.
    ///
    /// Tier priority: project tasks for the directory, then repository
    /// tasks fanned out across the repository's directories, then global
    /// tasks. Within a tier, `order_index` ascending; a lost claim race
    /// retries the next candidate in the same tier.
    ///
    /// # Errors
    ///
    /// Fails with ScopeMismatch when the directory belongs to another
    /// scope, and with Validation when neither directory nor repository is
    /// given.
    pub async fn pull_task(
        &self,
        controller_id: &str,
        directory_id: Option<&str>,
        repository_id: Option<&str>,
    ) -> Result<TaskPullOutcome, StoreError> {
        if directory_id.is_none() && repository_id.is_none() {
            return Err(StoreError::Validation(
                "requires directoryId or repositoryId".to_string(),
            ));
        }

        let directory = match directory_id {
            Some(id) => match self.store.get_directory(id).await? {
                Some(dir) => Some(dir),
                None => {
                    return Ok(TaskPullOutcome {
                        availability: Some("blocked-untracked".to_string()),
                        ..TaskPullOutcome::default()
                    });
                }
            },
            None => None,
        };

        if let Some(dir) = &directory {
            if dir.scope != self.scope {
                return Err(StoreError::ScopeMismatch);
            }
            if let (Some(requested), Some(associated)) = (repository_id, &dir.repository_id) {
                if requested != associated {
                    return Ok(TaskPullOutcome {
                        availability: Some("blocked-repository-mismatch".to_string()),
                        ..TaskPullOutcome::default()
                    });
                }
            }
            if let Some(block) = self.directory_block(dir).await? {
                return Ok(TaskPullOutcome {
                    availability: Some(block),
                    ..TaskPullOutcome::default()
                });
            }
        }

        let ready = self
            .store
            .list_tasks(
                &self.scope,
                &TaskFilter {
                    status: Some(TaskStatus::Ready),
                    ..TaskFilter::default()
                },
            )
            .await?;

        let mut pin_blocked = false;

        // Tier 1: project tasks for the directory.
        if let Some(dir) = &directory {
            let settings = self
                .store
                .get_project_settings(&dir.id)
                .await?
                .unwrap_or_default();
            let candidates = ready
                .iter()
                .filter(|t| t.project_id.as_deref() == Some(dir.id.as_str()));
            if let Some(task) = self
                .claim_first(candidates, controller_id, Some(&dir.id), &settings, &mut pin_blocked)
                .await?
            {
                return Ok(TaskPullOutcome {
                    task: Some(PulledTask::from(&task)),
                    ..TaskPullOutcome::default()
                });
            }
            if settings.task_focus_mode == TaskFocusMode::OwnOnly {
                return Ok(Self::empty_outcome(pin_blocked));
            }
        }

        // Tier 2: repository tasks, fanned out to an eligible directory.
        let repo_for_tier2 = repository_id
            .map(ToString::to_string)
            .or_else(|| directory.as_ref().and_then(|d| d.repository_id.clone()));
        if let Some(repo) = repo_for_tier2 {
            let target_dir = match &directory {
                Some(dir) => Some(dir.id.clone()),
                None => self.best_fanout_directory(&repo).await?,
            };
            if directory.is_none() && target_dir.is_none() {
                // Repository pull with no usable directory.
                let tracked = self.directories_for_repository(&repo).await?;
                let availability = if tracked.is_empty() {
                    "blocked-untracked"
                } else {
                    "blocked-occupied"
                };
                return Ok(TaskPullOutcome {
                    availability: Some(availability.to_string()),
                    ..TaskPullOutcome::default()
                });
            }
            if let Some(target) = target_dir {
                let settings = self
                    .store
                    .get_project_settings(&target)
                    .await?
                    .unwrap_or_default();
                let candidates = ready
                    .iter()
                    .filter(|t| t.repository_id.as_deref() == Some(repo.as_str()));
                if let Some(task) = self
                    .claim_first(candidates, controller_id, Some(&target), &settings, &mut pin_blocked)
                    .await?
                {
                    return Ok(TaskPullOutcome {
                        task: Some(PulledTask::from(&task)),
                        ..TaskPullOutcome::default()
                    });
                }
            }
        }

        // Tier 3: global tasks in the same scope.
        let settings = ProjectSettings::default();
        let candidates = ready
            .iter()
            .filter(|t| t.project_id.is_none() && t.repository_id.is_none());
        if let Some(task) = self
            .claim_first(
                candidates,
                controller_id,
                directory.as_ref().map(|d| d.id.as_str()),
                &settings,
                &mut pin_blocked,
            )
            .await?
        {
            return Ok(TaskPullOutcome {
                task: Some(PulledTask::from(&task)),
                ..TaskPullOutcome::default()
            });
        }

        Ok(Self::empty_outcome(pin_blocked))
    }

    fn empty_outcome(pin_blocked: bool) -> TaskPullOutcome {
        if pin_blocked {
            TaskPullOutcome {
                availability: Some("blocked-pinned-branch".to_string()),
                reason: Some("no ready task".to_string()),
                ..TaskPullOutcome::default()
            }
        } else {
            TaskPullOutcome {
                reason: Some("no ready task".to_string()),
                ..TaskPullOutcome::default()
            }
        }
    }

    async fn claim_first<'a>(
        &self,
        candidates: impl Iterator<Item = &'a Task>,
        controller_id: &str,
        directory_id: Option<&str>,
        settings: &ProjectSettings,
        pin_blocked: &mut bool,
    ) -> Result<Option<Task>, StoreError> {
        for candidate in candidates {
            if let (Some(pinned), Some(base)) = (&settings.pinned_branch, &candidate.base_branch) {
                if pinned != base {
                    *pin_blocked = true;
                    continue;
                }
            }
            match self
                .store
                .try_claim_task(&candidate.id, controller_id, directory_id, None, None)
                .await?
            {
                Some(task) => {
                    self.emit_task_updated(&task).await;
                    return Ok(Some(task));
                }
                // Lost the race; retry the next candidate in this tier.
                None => continue,
            }
        }
        Ok(None)
    }

    async fn directory_block(&self, directory: &Directory) -> Result<Option<String>, StoreError> {
        let policy = self.effective_policy(directory).await?;
        if policy.frozen {
            return Ok(Some("blocked-frozen".to_string()));
        }
        if !policy.automation_enabled {
            return Ok(Some("blocked-disabled".to_string()));
        }
        if self.directory_occupied(&directory.id).await? {
            return Ok(Some("blocked-occupied".to_string()));
        }
        if let Some(snapshot) = self.cached_git_status(&directory.id).await {
            if snapshot.is_dirty() {
                return Ok(Some("blocked-dirty".to_string()));
            }
        }
        Ok(None)
    }

    async fn directory_occupied(&self, directory_id: &str) -> Result<bool, StoreError> {
        let in_progress = self
            .store
            .list_tasks(
                &self.scope,
                &TaskFilter {
                    status: Some(TaskStatus::InProgress),
                    ..TaskFilter::default()
                },
            )
            .await?;
        Ok(in_progress
            .iter()
            .any(|t| t.claimed_by_directory_id.as_deref() == Some(directory_id)))
    }

    async fn directories_for_repository(
        &self,
        repository_id: &str,
    ) -> Result<Vec<Directory>, StoreError> {
        Ok(self
            .store
            .list_directories(&self.scope, false)
            .await?
            .into_iter()
            .filter(|d| d.repository_id.as_deref() == Some(repository_id))
            .collect())
    }

    async fn best_fanout_directory(
        &self,
        repository_id: &str,
    ) -> Result<Option<String>, StoreError> {
        for directory in self.directories_for_repository(repository_id).await? {
            if self.directory_block(&directory).await?.is_none() {
                return Ok(Some(directory.id));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    async fn state() -> StateStore {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let router = Arc::new(SubscriptionRouter::new());
        StateStore::new(store, router, Scope::default())
    }

    async fn ready_task(
        state: &StateStore,
        id: &str,
        project: Option<&str>,
        repository: Option<&str>,
        order: i64,
    ) {
        state
            .create_task(
                Some(id.to_string()),
                id.to_string(),
                String::new(),
                repository.map(ToString::to_string),
                project.map(ToString::to_string),
                Some(order),
                None,
            )
            .await
            .unwrap();
        state
            .transition_task(id, TaskStatus::Ready)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upsert_directory_is_idempotent() {
        let state = state().await;
        let first = state
            .upsert_directory(Some("directory-a".into()), "/tmp/a".into())
            .await
            .unwrap();
        let second = state
            .upsert_directory(Some("directory-a".into()), "/tmp/a".into())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(state.list_directories(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_directory_by_path_reuses_row() {
        let state = state().await;
        let first = state.upsert_directory(None, "/tmp/b".into()).await.unwrap();
        let second = state.upsert_directory(None, "/tmp/b".into()).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_repository_update_unknown_fails_not_found() {
        let state = state().await;
        let err = state
            .update_repository("repository-missing", RepositoryPatch::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("repository not found"));
    }

    #[tokio::test]
    async fn test_repository_upsert_keeps_remote_stable() {
        let state = state().await;
        let repo = state
            .upsert_repository(
                Some("repository-1".into()),
                "widgets".into(),
                "git@github.com:acme/widgets.git".into(),
                None,
                serde_json::Map::new(),
            )
            .await
            .unwrap();
        assert_eq!(repo.remote_url, "https://github.com/acme/widgets");

        let again = state
            .upsert_repository(
                Some("repository-1".into()),
                "widgets-renamed".into(),
                "https://github.com/acme/widgets".into(),
                Some("develop".into()),
                serde_json::Map::new(),
            )
            .await
            .unwrap();
        assert_eq!(again.remote_url, "https://github.com/acme/widgets");
        assert_eq!(again.name, "widgets-renamed");
        assert_eq!(again.default_branch, "develop");
    }

    #[tokio::test]
    async fn test_task_ready_then_draft_restores_state() {
        let state = state().await;
        ready_task(&state, "task-1", None, None, 0).await;

        let drafted = state
            .transition_task("task-1", TaskStatus::Draft)
            .await
            .unwrap();
        assert_eq!(drafted.status, TaskStatus::Draft);
        assert!(drafted.claimed_by_controller_id.is_none());
    }

    #[tokio::test]
    async fn test_claim_conflict_surfaces_already_claimed() {
        let state = state().await;
        ready_task(&state, "task-1", None, None, 0).await;

        state
            .claim_task("task-1", "controller-a", None, None, None)
            .await
            .unwrap();
        let err = state
            .claim_task("task-1", "controller-b", None, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("task already claimed: task-1"));
    }

    #[tokio::test]
    async fn test_pull_requires_directory_or_repository() {
        let state = state().await;
        let err = state.pull_task("controller-a", None, None).await.unwrap_err();
        assert!(err.to_string().contains("requires directoryId or repositoryId"));
    }

    #[tokio::test]
    async fn test_pull_untracked_directory() {
        let state = state().await;
        let outcome = state
            .pull_task("controller-a", Some("directory-ghost"), None)
            .await
            .unwrap();
        assert!(outcome.task.is_none());
        assert_eq!(outcome.availability.as_deref(), Some("blocked-untracked"));
    }

    #[tokio::test]
    async fn test_pull_priority_project_over_repository_over_global() {
        let state = state().await;
        state
            .upsert_directory(Some("directory-a".into()), "/tmp/a".into())
            .await
            .unwrap();
        state
            .upsert_repository(
                Some("repository-pull".into()),
                "pull".into(),
                "https://github.com/acme/pull".into(),
                None,
                serde_json::Map::new(),
            )
            .await
            .unwrap();

        ready_task(&state, "task-global-fallback", None, None, 2).await;
        ready_task(
            &state,
            "task-repository-fanout",
            None,
            Some("repository-pull"),
            1,
        )
        .await;
        ready_task(&state, "task-project-priority", Some("directory-a"), None, 0).await;

        let outcome = state
            .pull_task("controller-a", Some("directory-a"), None)
            .await
            .unwrap();
        assert_eq!(
            outcome.task.unwrap().task_id,
            "task-project-priority"
        );
    }

    #[tokio::test]
    async fn test_pull_own_only_skips_other_tiers() {
        let state = state().await;
        state
            .upsert_directory(Some("directory-a".into()), "/tmp/a".into())
            .await
            .unwrap();
        ready_task(&state, "task-project-priority", Some("directory-a"), None, 0).await;
        ready_task(&state, "task-global-fallback", None, None, 1).await;

        // First pull takes the project task.
        let outcome = state
            .pull_task("controller-a", Some("directory-a"), None)
            .await
            .unwrap();
        assert_eq!(outcome.task.unwrap().task_id, "task-project-priority");

        // Draft it back and restrict the directory to its own tasks.
        state
            .transition_task("task-project-priority", TaskStatus::Draft)
            .await
            .unwrap();
        state
            .update_project_settings(
                "directory-a",
                None,
                Some(TaskFocusMode::OwnOnly),
                None,
            )
            .await
            .unwrap();

        let outcome = state
            .pull_task("controller-b", Some("directory-a"), None)
            .await
            .unwrap();
        assert!(outcome.task.is_none());
        assert!(outcome.reason.unwrap().contains("no ready task"));
    }

    #[tokio::test]
    async fn test_pull_blocked_frozen_policy() {
        let state = state().await;
        state
            .upsert_directory(Some("directory-a".into()), "/tmp/a".into())
            .await
            .unwrap();
        state
            .set_policy(PolicyScope::Project, Some("directory-a"), None, Some(true))
            .await
            .unwrap();
        ready_task(&state, "task-1", Some("directory-a"), None, 0).await;

        let outcome = state
            .pull_task("controller-a", Some("directory-a"), None)
            .await
            .unwrap();
        assert_eq!(outcome.availability.as_deref(), Some("blocked-frozen"));
    }

    #[tokio::test]
    async fn test_pull_blocked_occupied() {
        let state = state().await;
        state
            .upsert_directory(Some("directory-a".into()), "/tmp/a".into())
            .await
            .unwrap();
        ready_task(&state, "task-busy", Some("directory-a"), None, 0).await;
        state
            .claim_task("task-busy", "controller-a", Some("directory-a"), None, None)
            .await
            .unwrap();
        ready_task(&state, "task-next", Some("directory-a"), None, 1).await;

        let outcome = state
            .pull_task("controller-b", Some("directory-a"), None)
            .await
            .unwrap();
        assert_eq!(outcome.availability.as_deref(), Some("blocked-occupied"));
    }

    #[tokio::test]
    async fn test_pull_never_hands_same_task_twice() {
        let state = state().await;
        state
            .upsert_directory(Some("directory-a".into()), "/tmp/a".into())
            .await
            .unwrap();
        state
            .upsert_directory(Some("directory-b".into()), "/tmp/b".into())
            .await
            .unwrap();
        ready_task(&state, "task-1", None, None, 0).await;

        let first = state
            .pull_task("controller-a", Some("directory-a"), None)
            .await
            .unwrap();
        let second = state
            .pull_task("controller-b", Some("directory-b"), None)
            .await
            .unwrap();
        assert_eq!(first.task.unwrap().task_id, "task-1");
        assert!(second.task.is_none());
    }

    #[tokio::test]
    async fn test_archived_conversation_update_emits_nothing() {
        let state = state().await;
        let convo = state
            .create_conversation(Some("conversation-1".into()), None, None, AgentType::Claude)
            .await
            .unwrap();
        state.archive_conversation(&convo.id).await.unwrap();

        let mut tap = state.router().register_tap();
        // Drain nothing: tap registered after archive.
        state
            .update_conversation(&convo.id, Some("new title".into()), None)
            .await
            .unwrap();
        assert!(tap.try_recv().is_err());
    }
}
