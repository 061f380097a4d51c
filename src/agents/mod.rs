//! Launch composition per agent type. Each adapter turns user args plus
//! daemon context into the final program/args/env for the PTY child.

/// Claude Code launch composition (hook settings injection).
pub mod claude;
/// Codex launch composition (OTLP exporter + resume injection).
pub mod codex;
/// Cursor agent launch composition (hook env injection).
pub mod cursor;
/// Plain shell launch composition.
pub mod terminal;
/// Shared launch types.
pub mod traits;

use crate::core::AgentType;

pub use traits::{LaunchContext, LaunchMode, LaunchSpec, TelemetryTarget};

/// Compose the launch spec for a session.
#[must_use]
pub fn compose_launch(agent_type: AgentType, ctx: &LaunchContext<'_>) -> LaunchSpec {
    match agent_type {
        AgentType::Codex => codex::compose(ctx),
        AgentType::Claude => claude::compose(ctx),
        AgentType::Cursor => cursor::compose(ctx),
        AgentType::Terminal => terminal::compose(ctx),
    }
}
