//! Durable state: entity CRUD behind an [`async_trait`] store, plus the
//! single-writer [`StateStore`] facade that orders writes and emits events.

/// SQLite-backed [`Store`] implementation.
pub mod sqlite;
/// Single-writer facade: validation, event emission, task pull.
pub mod state;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::conversation::Conversation;
use crate::core::directory::Directory;
use crate::core::policy::{AutomationPolicy, PolicyScope, ProjectSettings};
use crate::core::repository::Repository;
use crate::core::scope::Scope;
use crate::core::task::{Task, TaskStatus};

pub use sqlite::SqliteStore;
pub use state::{StateStore, TaskPullOutcome};

/// Errors surfaced by store operations. Messages are matched by substring in
/// `command.failed` replies, so the wording here is part of the protocol.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity lookup failed.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity noun, e.g. `directory`, `task`, `conversation`.
        entity: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// A claim raced another controller and lost.
    #[error("task already claimed: {task_id}")]
    AlreadyClaimed {
        /// The contested task.
        task_id: String,
    },

    /// A pull referenced a directory outside the request scope.
    #[error("task pull scope mismatch")]
    ScopeMismatch,

    /// Request-shape validation failed.
    #[error("{0}")]
    Validation(String),

    /// Underlying database failure.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Row payload (de)serialization failure.
    #[error("malformed row payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl StoreError {
    /// Shorthand for a [`StoreError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, id: &str) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Filters for [`Store::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to one status.
    pub status: Option<TaskStatus>,

    /// Restrict to one repository.
    pub repository_id: Option<String>,

    /// Restrict to one project (directory).
    pub project_id: Option<String>,
}

/// Durable entity storage. All methods operate on committed state; the
/// [`StateStore`] facade provides ordering and event emission on top.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Directories ────────────────────────────────────────────────────
    /// Insert or replace a directory row.
    async fn save_directory(&self, directory: &Directory) -> Result<(), StoreError>;

    /// Fetch a directory by id.
    async fn get_directory(&self, id: &str) -> Result<Option<Directory>, StoreError>;

    /// Find the non-archived directory registered at `path` within `scope`.
    async fn find_directory_by_path(
        &self,
        scope: &Scope,
        path: &str,
    ) -> Result<Option<Directory>, StoreError>;

    /// List directories in `scope`.
    async fn list_directories(
        &self,
        scope: &Scope,
        include_archived: bool,
    ) -> Result<Vec<Directory>, StoreError>;

    // ── Repositories ───────────────────────────────────────────────────
    /// Insert or replace a repository row.
    async fn save_repository(&self, repository: &Repository) -> Result<(), StoreError>;

    /// Fetch a repository by id.
    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, StoreError>;

    /// Find the non-archived repository with this normalized remote URL.
    async fn find_repository_by_remote(
        &self,
        scope: &Scope,
        remote_url: &str,
    ) -> Result<Option<Repository>, StoreError>;

    /// List repositories in `scope`.
    async fn list_repositories(
        &self,
        scope: &Scope,
        include_archived: bool,
    ) -> Result<Vec<Repository>, StoreError>;

    // ── Conversations ──────────────────────────────────────────────────
    /// Insert or replace a conversation row.
    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;

    /// Fetch a conversation by id.
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Delete a conversation row. Returns whether it existed.
    async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError>;

    /// List conversations, optionally restricted to one directory.
    async fn list_conversations(
        &self,
        scope: &Scope,
        directory_id: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<Conversation>, StoreError>;

    // ── Tasks ──────────────────────────────────────────────────────────
    /// Insert or replace a task row.
    async fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Fetch a task by id.
    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Delete a task row. Returns whether it existed.
    async fn delete_task(&self, id: &str) -> Result<bool, StoreError>;

    /// List tasks in `scope` matching `filter`, ordered by `order_index`.
    async fn list_tasks(&self, scope: &Scope, filter: &TaskFilter)
    -> Result<Vec<Task>, StoreError>;

    /// Atomically claim a ready, unclaimed task. Returns the claimed row, or
    /// `None` when the task was not ready/unclaimed at commit time.
    async fn try_claim_task(
        &self,
        task_id: &str,
        controller_id: &str,
        directory_id: Option<&str>,
        branch_name: Option<&str>,
        base_branch: Option<&str>,
    ) -> Result<Option<Task>, StoreError>;

    /// Largest order index currently in use within `scope`.
    async fn max_task_order_index(&self, scope: &Scope) -> Result<i64, StoreError>;

    // ── Policies & settings ────────────────────────────────────────────
    /// Fetch the policy row at (`scope_level`, `scope_id`).
    async fn get_policy(
        &self,
        scope_level: PolicyScope,
        scope_id: Option<&str>,
    ) -> Result<Option<AutomationPolicy>, StoreError>;

    /// Insert or replace a policy row.
    async fn save_policy(&self, policy: &AutomationPolicy) -> Result<(), StoreError>;

    /// Fetch the project settings for a directory.
    async fn get_project_settings(
        &self,
        directory_id: &str,
    ) -> Result<Option<ProjectSettings>, StoreError>;

    /// Insert or replace project settings for a directory.
    async fn save_project_settings(
        &self,
        directory_id: &str,
        settings: &ProjectSettings,
    ) -> Result<(), StoreError>;

    // ── Event log ──────────────────────────────────────────────────────
    /// Append a fan-out event to the durable log.
    async fn record_event(
        &self,
        cursor: u64,
        scope: &serde_json::Value,
        body: &serde_json::Value,
    ) -> Result<(), StoreError>;
}
