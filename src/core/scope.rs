use serde::{Deserialize, Serialize};

/// Tenant/user/workspace scope carried by every durable entity.
///
/// Entity keys are unique per scope unless noted otherwise; events carry the
/// scope of the entity they describe so the router can filter fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    /// Tenant identifier.
    pub tenant_id: String,

    /// User identifier within the tenant.
    pub user_id: String,

    /// Workspace identifier within the tenant.
    pub workspace_id: String,
}

impl Scope {
    /// Build a scope from the harness environment variables, falling back
    /// to `"local"` for any that are unset.
    #[must_use]
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_else(|_| "local".to_string());
        Self {
            tenant_id: var("HARNESS_TENANT_ID"),
            user_id: var("HARNESS_USER_ID"),
            workspace_id: var("HARNESS_WORKSPACE_ID"),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tenant_id, self.user_id, self.workspace_id
        )
    }
}
