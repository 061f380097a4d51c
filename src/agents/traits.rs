use std::path::Path;

/// Everything launch composition may draw on.
#[derive(Debug)]
pub struct LaunchContext<'a> {
    /// Session id (== conversation id).
    pub session_id: &'a str,

    /// User-supplied arguments, passed through verbatim after injection.
    pub user_args: &'a [String],

    /// Daemon launch mode.
    pub launch_mode: LaunchMode,

    /// Telemetry export target, when telemetry is enabled for the session.
    pub telemetry: Option<TelemetryTarget>,

    /// Provider-side session id to resume, when known.
    pub resume_session_id: Option<&'a str>,

    /// Notify-file sink adapter hooks append JSONL records to.
    pub notify_file: &'a Path,
}

/// Daemon launch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// Normal interactive launch.
    #[default]
    Standard,

    /// Auto-approving launch; adds `--yolo` for codex.
    Yolo,
}

impl std::str::FromStr for LaunchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "yolo" => Ok(Self::Yolo),
            _ => anyhow::bail!("unknown launch mode: {s}"),
        }
    }
}

/// Where a session's telemetry lands.
#[derive(Debug, Clone)]
pub struct TelemetryTarget {
    /// Full logs exporter URL including the per-session token, e.g.
    /// `http://127.0.0.1:4318/v1/logs/<token>`.
    pub exporter_url: String,
}

/// The composed child process launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program to execute.
    pub program: String,

    /// Arguments.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// A spec with no extra env.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }
}
