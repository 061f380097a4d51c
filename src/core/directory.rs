use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::Scope;

/// A tracked project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    /// Unique identifier.
    pub id: String,

    /// Owning scope. The path is unique per scope among non-archived rows.
    pub scope: Scope,

    /// Absolute path of the project root.
    pub path: String,

    /// Repository this directory was last observed to belong to, if known.
    pub repository_id: Option<String>,

    /// When the directory was registered.
    pub created_at: DateTime<Utc>,

    /// When the directory was archived, if it was.
    pub archived_at: Option<DateTime<Utc>>,
}

impl Directory {
    /// Whether the directory has been archived.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// Ephemeral per-directory git status cache. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusSnapshot {
    /// Currently checked-out branch.
    pub branch: Option<String>,

    /// Number of changed files in the working tree.
    pub changed_files: u32,

    /// Added lines across changed files.
    pub additions: u32,

    /// Deleted lines across changed files.
    pub deletions: u32,

    /// Normalized remote URL snapshot, when the directory is a git repo.
    pub repository_snapshot: Option<String>,

    /// Repository id matched from the snapshot, if tracked.
    pub repository_id: Option<String>,

    /// Milliseconds-since-epoch of the last refresh.
    pub last_refreshed_at_ms: i64,
}

impl GitStatusSnapshot {
    /// Whether the working tree has uncommitted changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.changed_files > 0
    }
}
