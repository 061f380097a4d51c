use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::Scope;

/// A scoped work item pulled and claimed by controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier.
    pub id: String,

    /// Owning scope.
    pub scope: Scope,

    /// Repository-scoped tasks fan out across that repository's directories.
    pub repository_id: Option<String>,

    /// Project-scoped tasks belong to a single directory.
    pub project_id: Option<String>,

    /// Short title.
    pub title: String,

    /// Full body.
    pub body: String,

    /// Lifecycle status.
    pub status: TaskStatus,

    /// Ordering key, unique within (scope, parent).
    pub order_index: i64,

    /// Controller holding the claim while in-progress.
    pub claimed_by_controller_id: Option<String>,

    /// Directory the claim is bound to, if any.
    pub claimed_by_directory_id: Option<String>,

    /// Branch the work happens on.
    pub branch_name: Option<String>,

    /// Base branch the work branch forks from.
    pub base_branch: Option<String>,

    /// Linear issue metadata, when the task mirrors a Linear issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linear: Option<LinearMetadata>,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a draft task.
    #[must_use]
    pub fn new(id: String, scope: Scope, title: String, body: String, order_index: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            scope,
            repository_id: None,
            project_id: None,
            title,
            body,
            status: TaskStatus::Draft,
            order_index,
            claimed_by_controller_id: None,
            claimed_by_directory_id: None,
            branch_name: None,
            base_branch: None,
            linear: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clear claim fields. Used when a task is drafted or re-queued.
    pub fn release_claim(&mut self) {
        self.claimed_by_controller_id = None;
        self.claimed_by_directory_id = None;
        self.updated_at = Utc::now();
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Being written; not eligible for pull.
    #[default]
    Draft,

    /// Eligible for pull and claim.
    Ready,

    /// Claimed by exactly one controller.
    InProgress,

    /// Finished.
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => anyhow::bail!("unknown task status: {s}"),
        }
    }
}

/// Linear issue metadata attached to mirrored tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearMetadata {
    /// Linear issue id.
    pub issue_id: String,

    /// Human issue key, e.g. `ENG-123`.
    pub issue_key: String,

    /// Issue URL.
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_round_trip() {
        for s in ["draft", "ready", "in-progress", "completed"] {
            let parsed: TaskStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
            assert_eq!(serde_json::to_string(&parsed).unwrap(), format!("\"{s}\""));
        }
    }

    #[test]
    fn test_release_claim_clears_both_fields() {
        let mut task = Task::new(
            "task-1".into(),
            Scope::default(),
            "title".into(),
            String::new(),
            0,
        );
        task.claimed_by_controller_id = Some("controller-a".into());
        task.claimed_by_directory_id = Some("directory-a".into());
        task.release_claim();
        assert!(task.claimed_by_controller_id.is_none());
        assert!(task.claimed_by_directory_id.is_none());
    }
}
