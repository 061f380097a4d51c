//! Core domain types: scopes, entities, runtime projections, key events.

/// Conversation (thread) entity and runtime projection.
pub mod conversation;
/// Tracked project directory entity.
pub mod directory;
/// Normalized key events derived from telemetry and hooks.
pub mod keyevent;
/// Automation policies and per-directory project settings.
pub mod policy;
/// Tracked repository entity.
pub mod repository;
/// Tenant/user/workspace scoping.
pub mod scope;
/// Scoped work items.
pub mod task;

pub use conversation::{
    AdapterSlot, AdapterState, AgentType, Controller, ControllerType, Conversation, ExitStatus,
    RuntimeStatus,
};
pub use directory::{Directory, GitStatusSnapshot};
pub use keyevent::{KeyEvent, KeyEventSource, StatusHint};
pub use policy::{AutomationPolicy, PolicyScope, ProjectSettings, TaskFocusMode, ThreadSpawnMode};
pub use repository::{Repository, normalize_remote_url};
pub use scope::Scope;
pub use task::{Task, TaskStatus};
