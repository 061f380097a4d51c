use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalized event derived from OTLP telemetry or a hook notify record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    /// Where the event came from.
    pub source: KeyEventSource,

    /// Provider-side observation timestamp.
    pub observed_at: DateTime<Utc>,

    /// Normalized event name, e.g. `codex.user_prompt` or `claude.stop`.
    pub event_name: String,

    /// Severity text when the source supplied one (`ERROR`, `WARN`, ...).
    pub severity: Option<String>,

    /// Short human-readable summary (log body, metric name, hook message).
    pub summary: String,

    /// Provider-side thread/session id, when observed.
    pub provider_thread_id: Option<String>,

    /// Status transition this event suggests, if any.
    pub status_hint: Option<StatusHint>,

    /// Raw source payload for consumers that need more than the summary.
    pub payload: serde_json::Value,
}

/// Where a key event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEventSource {
    /// OTLP HTTP ingest.
    Otlp,

    /// Adapter hook notify file.
    Hook,
}

/// Status transition suggested by a key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusHint {
    /// The agent started or resumed working.
    Running,

    /// The current turn finished.
    Completed,

    /// The agent is blocked on an approval.
    NeedsInput,
}

impl KeyEvent {
    /// Dedup key: two events with the same name and timestamp for a session
    /// are considered duplicates.
    #[must_use]
    pub fn dedup_key(&self) -> (String, DateTime<Utc>) {
        (self.event_name.clone(), self.observed_at)
    }
}
