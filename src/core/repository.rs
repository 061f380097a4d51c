use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scope::Scope;

/// A tracked repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Unique identifier.
    pub id: String,

    /// Owning scope.
    pub scope: Scope,

    /// Display name.
    pub name: String,

    /// Normalized remote URL. Stable across updates.
    pub remote_url: String,

    /// Default branch used as the base for task branches.
    pub default_branch: String,

    /// Free-form metadata map.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// When the repository was registered.
    pub created_at: DateTime<Utc>,

    /// When the repository was archived, if it was.
    pub archived_at: Option<DateTime<Utc>>,
}

impl Repository {
    /// Whether the repository has been archived.
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// Normalize a git remote URL so equivalent remotes compare equal.
///
/// `git@host:owner/repo.git`, `https://host/owner/repo.git`, and
/// `https://host/owner/repo` all normalize to `https://host/owner/repo`.
#[must_use]
pub fn normalize_remote_url(url: &str) -> String {
    let url = url.trim();
    let url = url.strip_suffix(".git").unwrap_or(url);

    if let Some(rest) = url.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            return format!("https://{host}/{}", path.trim_start_matches('/'));
        }
    }
    if let Some(rest) = url.strip_prefix("ssh://git@") {
        return format!("https://{}", rest.trim_start_matches('/'));
    }

    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ssh_remote() {
        assert_eq!(
            normalize_remote_url("git@github.com:acme/widgets.git"),
            "https://github.com/acme/widgets"
        );
    }

    #[test]
    fn test_normalize_https_remote() {
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widgets.git"),
            "https://github.com/acme/widgets"
        );
        assert_eq!(
            normalize_remote_url("https://github.com/acme/widgets/"),
            "https://github.com/acme/widgets"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_remote_url("git@github.com:acme/widgets.git");
        assert_eq!(normalize_remote_url(&once), once);
    }
}
