use serde::{Deserialize, Serialize};

/// Automation gate at global, project, or repository scope.
///
/// Precedence when resolving an effective policy: repository > project >
/// global.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationPolicy {
    /// Which level this policy applies at.
    pub scope: PolicyScope,

    /// Directory or repository id for non-global policies.
    pub scope_id: Option<String>,

    /// Whether automation may pull and claim tasks under this policy.
    pub automation_enabled: bool,

    /// A frozen policy blocks automation regardless of `automation_enabled`.
    pub frozen: bool,
}

impl AutomationPolicy {
    /// Permissive default used when no policy row exists.
    #[must_use]
    pub fn permissive(scope: PolicyScope, scope_id: Option<String>) -> Self {
        Self {
            scope,
            scope_id,
            automation_enabled: true,
            frozen: false,
        }
    }
}

/// Level an automation policy applies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    /// Applies everywhere in the tenant scope.
    Global,

    /// Applies to one directory.
    Project,

    /// Applies to one repository.
    Repository,
}

impl std::fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Global => "global",
            Self::Project => "project",
            Self::Repository => "repository",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PolicyScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "project" => Ok(Self::Project),
            "repository" => Ok(Self::Repository),
            _ => anyhow::bail!("unknown policy scope: {s}"),
        }
    }
}

/// Per-directory settings steering task pull and thread spawning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    /// When set, the directory stays on this branch; tasks targeting another
    /// base branch are blocked.
    pub pinned_branch: Option<String>,

    /// Which task tiers a pull from this directory may consider.
    #[serde(default)]
    pub task_focus_mode: TaskFocusMode,

    /// Whether automation reuses an existing thread or spawns a new one.
    #[serde(default)]
    pub thread_spawn_mode: ThreadSpawnMode,
}

/// Which task tiers a pull from a directory may consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskFocusMode {
    /// Project tasks first, then repository fan-out, then global.
    #[default]
    Balanced,

    /// Only tasks scoped to this directory.
    OwnOnly,
}

/// Whether automation reuses threads or spawns fresh ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadSpawnMode {
    /// Spawn a fresh thread per task.
    #[default]
    NewThread,

    /// Reuse the directory's existing thread.
    ReuseThread,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_scope_round_trip() {
        for s in ["global", "project", "repository"] {
            let parsed: PolicyScope = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn test_project_settings_defaults() {
        let settings: ProjectSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.task_focus_mode, TaskFocusMode::Balanced);
        assert_eq!(settings.thread_spawn_mode, ThreadSpawnMode::NewThread);
        assert!(settings.pinned_branch.is_none());
    }

    #[test]
    fn test_focus_mode_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&TaskFocusMode::OwnOnly).unwrap(),
            "\"own-only\""
        );
    }
}
