use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};

use super::{Store, StoreError, TaskFilter};
use crate::core::conversation::{AdapterState, Conversation, ExitStatus, RuntimeStatus};
use crate::core::directory::Directory;
use crate::core::policy::{AutomationPolicy, PolicyScope, ProjectSettings};
use crate::core::repository::Repository;
use crate::core::scope::Scope;
use crate::core::task::{Task, TaskStatus};

/// SQLite-backed store. One file holds every durable entity plus the event
/// log; migrations are additive so newer rows survive older readers.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the store at `db_path` and apply
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or migrations
    /// fail.
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Validation(format!("cannot create store dir: {e}")))?;
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))
        .map_err(StoreError::Database)?
        .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(pool)
                .await?
                .flatten();
        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_to_v1(pool).await?;
        }
        if current_version < 2 {
            Self::migrate_to_v2(pool).await?;
        }
        if current_version < 3 {
            Self::migrate_to_v3(pool).await?;
        }

        Ok(())
    }

    /// Migration v1: core entity tables.
    async fn migrate_to_v1(pool: &SqlitePool) -> Result<(), StoreError> {
        tracing::info!("Applying migration v1: core entities");

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS directories (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                archived_at TEXT
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                name TEXT NOT NULL,
                remote_url TEXT NOT NULL,
                default_branch TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                archived_at TEXT
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                directory_id TEXT,
                title TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                adapter_state TEXT NOT NULL DEFAULT '{}',
                runtime_status TEXT NOT NULL DEFAULT 'completed',
                attention_reason TEXT,
                runtime_last_event_at TEXT,
                runtime_last_exit TEXT,
                created_at TEXT NOT NULL,
                archived_at TEXT
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                repository_id TEXT,
                project_id TEXT,
                title TEXT NOT NULL,
                body TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                order_index INTEGER NOT NULL,
                claimed_by_controller_id TEXT,
                claimed_by_directory_id TEXT,
                branch_name TEXT,
                base_branch TEXT,
                linear TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS policies (
                scope_level TEXT NOT NULL,
                scope_id TEXT NOT NULL DEFAULT '',
                automation_enabled INTEGER NOT NULL,
                frozen INTEGER NOT NULL,
                PRIMARY KEY (scope_level, scope_id)
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS project_settings (
                directory_id TEXT PRIMARY KEY,
                settings TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_directory ON conversations(directory_id)",
        )
        .execute(pool)
        .await?;

        Self::record_version(pool, 1).await?;
        tracing::info!("Migration v1 complete");
        Ok(())
    }

    /// Migration v2: durable event log.
    async fn migrate_to_v2(pool: &SqlitePool) -> Result<(), StoreError> {
        tracing::info!("Applying migration v2: event log");

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS events (
                cursor INTEGER PRIMARY KEY,
                scope TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        Self::record_version(pool, 2).await?;
        tracing::info!("Migration v2 complete");
        Ok(())
    }

    /// Migration v3: directory→repository association for pull fan-out.
    async fn migrate_to_v3(pool: &SqlitePool) -> Result<(), StoreError> {
        tracing::info!("Applying migration v3: directory repository association");

        sqlx::query("ALTER TABLE directories ADD COLUMN repository_id TEXT")
            .execute(pool)
            .await?;

        Self::record_version(pool, 3).await?;
        tracing::info!("Migration v3 complete");
        Ok(())
    }

    async fn record_version(pool: &SqlitePool, version: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(Utc::now().to_rfc3339())
            .execute(pool)
            .await?;
        Ok(())
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|e| StoreError::Validation(format!("bad timestamp '{value}': {e}")))
}

fn opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_ts).transpose()
}

fn row_scope(row: &SqliteRow) -> Result<Scope, StoreError> {
    Ok(Scope {
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        workspace_id: row.try_get("workspace_id")?,
    })
}

fn row_to_directory(row: &SqliteRow) -> Result<Directory, StoreError> {
    Ok(Directory {
        id: row.try_get("id")?,
        scope: row_scope(row)?,
        path: row.try_get("path")?,
        repository_id: row.try_get("repository_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        archived_at: opt_ts(row.try_get("archived_at")?)?,
    })
}

fn row_to_repository(row: &SqliteRow) -> Result<Repository, StoreError> {
    Ok(Repository {
        id: row.try_get("id")?,
        scope: row_scope(row)?,
        name: row.try_get("name")?,
        remote_url: row.try_get("remote_url")?,
        default_branch: row.try_get("default_branch")?,
        metadata: serde_json::from_str(&row.try_get::<String, _>("metadata")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        archived_at: opt_ts(row.try_get("archived_at")?)?,
    })
}

fn row_to_conversation(row: &SqliteRow) -> Result<Conversation, StoreError> {
    let adapter_state: AdapterState =
        serde_json::from_str(&row.try_get::<String, _>("adapter_state")?)?;
    let runtime_status: RuntimeStatus = serde_json::from_value(serde_json::Value::String(
        row.try_get::<String, _>("runtime_status")?,
    ))?;
    let runtime_last_exit: Option<ExitStatus> = row
        .try_get::<Option<String>, _>("runtime_last_exit")?
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(Conversation {
        id: row.try_get("id")?,
        scope: row_scope(row)?,
        directory_id: row.try_get("directory_id")?,
        title: row.try_get("title")?,
        agent_type: serde_json::from_value(serde_json::Value::String(
            row.try_get::<String, _>("agent_type")?,
        ))?,
        adapter_state,
        runtime_status,
        runtime_live: false,
        attention_reason: row.try_get("attention_reason")?,
        runtime_process_id: None,
        runtime_last_event_at: opt_ts(row.try_get("runtime_last_event_at")?)?,
        runtime_last_exit,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        archived_at: opt_ts(row.try_get("archived_at")?)?,
    })
}

fn row_to_task(row: &SqliteRow) -> Result<Task, StoreError> {
    let status: TaskStatus =
        serde_json::from_value(serde_json::Value::String(row.try_get("status")?))?;
    let linear = row
        .try_get::<Option<String>, _>("linear")?
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(Task {
        id: row.try_get("id")?,
        scope: row_scope(row)?,
        repository_id: row.try_get("repository_id")?,
        project_id: row.try_get("project_id")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        status,
        order_index: row.try_get("order_index")?,
        claimed_by_controller_id: row.try_get("claimed_by_controller_id")?,
        claimed_by_directory_id: row.try_get("claimed_by_directory_id")?,
        branch_name: row.try_get("branch_name")?,
        base_branch: row.try_get("base_branch")?,
        linear,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::Validation(format!(
            "expected string encoding, got {other}"
        ))),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_directory(&self, directory: &Directory) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO directories
                (id, tenant_id, user_id, workspace_id, path, repository_id, created_at, archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&directory.id)
        .bind(&directory.scope.tenant_id)
        .bind(&directory.scope.user_id)
        .bind(&directory.scope.workspace_id)
        .bind(&directory.path)
        .bind(&directory.repository_id)
        .bind(directory.created_at.to_rfc3339())
        .bind(directory.archived_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_directory(&self, id: &str) -> Result<Option<Directory>, StoreError> {
        let row = sqlx::query("SELECT * FROM directories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_directory).transpose()
    }

    async fn find_directory_by_path(
        &self,
        scope: &Scope,
        path: &str,
    ) -> Result<Option<Directory>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT * FROM directories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND path = ? AND archived_at IS NULL
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_directory).transpose()
    }

    async fn list_directories(
        &self,
        scope: &Scope,
        include_archived: bool,
    ) -> Result<Vec<Directory>, StoreError> {
        let sql = if include_archived {
            r"
            SELECT * FROM directories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
            ORDER BY created_at
            "
        } else {
            r"
            SELECT * FROM directories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ? AND archived_at IS NULL
            ORDER BY created_at
            "
        };
        let rows = sqlx::query(sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_directory).collect()
    }

    async fn save_repository(&self, repository: &Repository) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO repositories
                (id, tenant_id, user_id, workspace_id, name, remote_url, default_branch,
                 metadata, created_at, archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&repository.id)
        .bind(&repository.scope.tenant_id)
        .bind(&repository.scope.user_id)
        .bind(&repository.scope.workspace_id)
        .bind(&repository.name)
        .bind(&repository.remote_url)
        .bind(&repository.default_branch)
        .bind(serde_json::to_string(&repository.metadata)?)
        .bind(repository.created_at.to_rfc3339())
        .bind(repository.archived_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, StoreError> {
        let row = sqlx::query("SELECT * FROM repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_repository).transpose()
    }

    async fn find_repository_by_remote(
        &self,
        scope: &Scope,
        remote_url: &str,
    ) -> Result<Option<Repository>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT * FROM repositories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
              AND remote_url = ? AND archived_at IS NULL
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .bind(remote_url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_repository).transpose()
    }

    async fn list_repositories(
        &self,
        scope: &Scope,
        include_archived: bool,
    ) -> Result<Vec<Repository>, StoreError> {
        let sql = if include_archived {
            r"
            SELECT * FROM repositories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
            ORDER BY created_at
            "
        } else {
            r"
            SELECT * FROM repositories
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ? AND archived_at IS NULL
            ORDER BY created_at
            "
        };
        let rows = sqlx::query(sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_repository).collect()
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO conversations
                (id, tenant_id, user_id, workspace_id, directory_id, title, agent_type,
                 adapter_state, runtime_status, attention_reason, runtime_last_event_at,
                 runtime_last_exit, created_at, archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&conversation.id)
        .bind(&conversation.scope.tenant_id)
        .bind(&conversation.scope.user_id)
        .bind(&conversation.scope.workspace_id)
        .bind(&conversation.directory_id)
        .bind(&conversation.title)
        .bind(enum_str(&conversation.agent_type)?)
        .bind(serde_json::to_string(&conversation.adapter_state)?)
        .bind(enum_str(&conversation.runtime_status)?)
        .bind(&conversation.attention_reason)
        .bind(conversation.runtime_last_event_at.map(|t| t.to_rfc3339()))
        .bind(
            conversation
                .runtime_last_exit
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.archived_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_conversations(
        &self,
        scope: &Scope,
        directory_id: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut sql = String::from(
            "SELECT * FROM conversations WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?",
        );
        if directory_id.is_some() {
            sql.push_str(" AND directory_id = ?");
        }
        if !include_archived {
            sql.push_str(" AND archived_at IS NULL");
        }
        sql.push_str(" ORDER BY created_at");

        let mut query = sqlx::query(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id);
        if let Some(dir) = directory_id {
            query = query.bind(dir);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_conversation).collect()
    }

    async fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO tasks
                (id, tenant_id, user_id, workspace_id, repository_id, project_id, title, body,
                 status, order_index, claimed_by_controller_id, claimed_by_directory_id,
                 branch_name, base_branch, linear, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&task.id)
        .bind(&task.scope.tenant_id)
        .bind(&task.scope.user_id)
        .bind(&task.scope.workspace_id)
        .bind(&task.repository_id)
        .bind(&task.project_id)
        .bind(&task.title)
        .bind(&task.body)
        .bind(enum_str(&task.status)?)
        .bind(task.order_index)
        .bind(&task.claimed_by_controller_id)
        .bind(&task.claimed_by_directory_id)
        .bind(&task.branch_name)
        .bind(&task.base_branch)
        .bind(task.linear.as_ref().map(serde_json::to_string).transpose()?)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_tasks(
        &self,
        scope: &Scope,
        filter: &TaskFilter,
    ) -> Result<Vec<Task>, StoreError> {
        let mut sql = String::from(
            "SELECT * FROM tasks WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?",
        );
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.repository_id.is_some() {
            sql.push_str(" AND repository_id = ?");
        }
        if filter.project_id.is_some() {
            sql.push_str(" AND project_id = ?");
        }
        sql.push_str(" ORDER BY order_index");

        let mut query = sqlx::query(&sql)
            .bind(&scope.tenant_id)
            .bind(&scope.user_id)
            .bind(&scope.workspace_id);
        if let Some(status) = filter.status {
            query = query.bind(enum_str(&status)?);
        }
        if let Some(repo) = &filter.repository_id {
            query = query.bind(repo);
        }
        if let Some(project) = &filter.project_id {
            query = query.bind(project);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn try_claim_task(
        &self,
        task_id: &str,
        controller_id: &str,
        directory_id: Option<&str>,
        branch_name: Option<&str>,
        base_branch: Option<&str>,
    ) -> Result<Option<Task>, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE tasks SET
                status = 'in-progress',
                claimed_by_controller_id = ?,
                claimed_by_directory_id = ?,
                branch_name = COALESCE(?, branch_name),
                base_branch = COALESCE(?, base_branch),
                updated_at = ?
            WHERE id = ? AND status = 'ready' AND claimed_by_controller_id IS NULL
            ",
        )
        .bind(controller_id)
        .bind(directory_id)
        .bind(branch_name)
        .bind(base_branch)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_task(task_id).await
    }

    async fn max_task_order_index(&self, scope: &Scope) -> Result<i64, StoreError> {
        let max: Option<i64> = sqlx::query_scalar(
            r"
            SELECT MAX(order_index) FROM tasks
            WHERE tenant_id = ? AND user_id = ? AND workspace_id = ?
            ",
        )
        .bind(&scope.tenant_id)
        .bind(&scope.user_id)
        .bind(&scope.workspace_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(max.unwrap_or(-1))
    }

    async fn get_policy(
        &self,
        scope_level: PolicyScope,
        scope_id: Option<&str>,
    ) -> Result<Option<AutomationPolicy>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM policies WHERE scope_level = ? AND scope_id = ?",
        )
        .bind(scope_level.to_string())
        .bind(scope_id.unwrap_or(""))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<AutomationPolicy, StoreError> {
            let scope_id: String = row.try_get("scope_id")?;
            Ok(AutomationPolicy {
                scope: scope_level,
                scope_id: (!scope_id.is_empty()).then_some(scope_id),
                automation_enabled: row.try_get::<i64, _>("automation_enabled")? != 0,
                frozen: row.try_get::<i64, _>("frozen")? != 0,
            })
        })
        .transpose()
    }

    async fn save_policy(&self, policy: &AutomationPolicy) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO policies (scope_level, scope_id, automation_enabled, frozen)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(policy.scope.to_string())
        .bind(policy.scope_id.as_deref().unwrap_or(""))
        .bind(i64::from(policy.automation_enabled))
        .bind(i64::from(policy.frozen))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project_settings(
        &self,
        directory_id: &str,
    ) -> Result<Option<ProjectSettings>, StoreError> {
        let settings: Option<String> =
            sqlx::query_scalar("SELECT settings FROM project_settings WHERE directory_id = ?")
                .bind(directory_id)
                .fetch_optional(&self.pool)
                .await?;
        settings
            .as_deref()
            .map(|s| serde_json::from_str(s).map_err(StoreError::from))
            .transpose()
    }

    async fn save_project_settings(
        &self,
        directory_id: &str,
        settings: &ProjectSettings,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO project_settings (directory_id, settings) VALUES (?, ?)",
        )
        .bind(directory_id)
        .bind(serde_json::to_string(settings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_event(
        &self,
        cursor: u64,
        scope: &serde_json::Value,
        body: &serde_json::Value,
    ) -> Result<(), StoreError> {
        #[allow(clippy::cast_possible_wrap)]
        sqlx::query("INSERT OR REPLACE INTO events (cursor, scope, body, timestamp) VALUES (?, ?, ?, ?)")
            .bind(cursor as i64)
            .bind(scope.to_string())
            .bind(body.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
