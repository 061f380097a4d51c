//! Hook notify bridge: adapter hooks append JSONL records to per-session
//! notify files; the bridge polls them and feeds the same key-event
//! pipeline as OTLP ingest.

/// Notify-file polling with idle backoff.
pub mod poller;

use chrono::Utc;
use serde_json::Value;

use crate::core::keyevent::{KeyEvent, KeyEventSource};
use crate::telemetry::keyevents::classify;

/// Map an appended notify record to a normalized key event.
///
/// Claude hooks write PascalCase `hook_event_name`s; cursor hooks write
/// camelCase ones. Unknown names are dropped.
#[must_use]
pub fn key_event_from_record(record: &Value) -> Option<KeyEvent> {
    let hook_name = record
        .get("hook_event_name")
        .or_else(|| record.get("hookEventName"))
        .and_then(Value::as_str)?;

    let event_name = normalize_hook_name(hook_name)?;

    let summary = record
        .get("prompt")
        .or_else(|| record.get("message"))
        .or_else(|| record.get("tool_name"))
        .and_then(Value::as_str)
        .map_or_else(|| event_name.clone(), ToString::to_string);

    let provider_thread_id = record
        .get("session_id")
        .or_else(|| record.get("sessionId"))
        .or_else(|| record.get("conversation_id"))
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let observed_at = record
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Utc::now);

    Some(KeyEvent {
        source: KeyEventSource::Hook,
        observed_at,
        status_hint: classify(&event_name, &summary, record),
        event_name,
        severity: None,
        summary,
        provider_thread_id,
        payload: record.clone(),
    })
}

fn normalize_hook_name(hook_name: &str) -> Option<String> {
    let mapped = match hook_name {
        // Claude hook events.
        "UserPromptSubmit" => "claude.userpromptsubmit",
        "PreToolUse" => "claude.pretooluse",
        "PostToolUse" => "claude.posttooluse",
        "Stop" => "claude.stop",
        "SubagentStop" => "claude.subagentstop",
        "SessionEnd" => "claude.sessionend",
        "Notification" => "claude.notification",
        // Cursor hook events.
        "beforeSubmitPrompt" => "cursor.beforesubmitprompt",
        "beforeShellExecution" => "cursor.beforeshellexecution",
        "beforeMcpTool" => "cursor.beforemcptool",
        "stop" => "cursor.stop",
        "sessionEnd" => "cursor.sessionend",
        _ => return None,
    };
    Some(mapped.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::keyevent::StatusHint;

    #[test]
    fn test_claude_user_prompt_submit_maps_to_running() {
        let record = serde_json::json!({
            "hook_event_name": "UserPromptSubmit",
            "prompt": "improve prompt capture parity",
            "session_id": "claude-session-123"
        });
        let event = key_event_from_record(&record).unwrap();
        assert_eq!(event.event_name, "claude.userpromptsubmit");
        assert_eq!(event.summary, "improve prompt capture parity");
        assert_eq!(event.provider_thread_id.as_deref(), Some("claude-session-123"));
        assert_eq!(event.status_hint, Some(StatusHint::Running));
        assert_eq!(event.source, KeyEventSource::Hook);
    }

    #[test]
    fn test_cursor_stop_maps_to_completed_even_when_aborted() {
        let record = serde_json::json!({
            "hook_event_name": "stop",
            "final_status": "aborted"
        });
        let event = key_event_from_record(&record).unwrap();
        assert_eq!(event.event_name, "cursor.stop");
        assert_eq!(event.status_hint, Some(StatusHint::Completed));
    }

    #[test]
    fn test_claude_notification_approval_needs_input() {
        let record = serde_json::json!({
            "hook_event_name": "Notification",
            "message": "claude needs permission to run a tool",
            "notification_type": "permission-request"
        });
        let event = key_event_from_record(&record).unwrap();
        assert_eq!(event.event_name, "claude.notification");
        assert_eq!(event.status_hint, Some(StatusHint::NeedsInput));
    }

    #[test]
    fn test_unknown_hook_name_dropped() {
        let record = serde_json::json!({ "hook_event_name": "SomethingElse" });
        assert!(key_event_from_record(&record).is_none());
        let empty = serde_json::json!({});
        assert!(key_event_from_record(&empty).is_none());
    }

    #[test]
    fn test_cursor_before_submit_prompt() {
        let record = serde_json::json!({
            "hook_event_name": "beforeSubmitPrompt",
            "prompt": "do the thing"
        });
        let event = key_event_from_record(&record).unwrap();
        assert_eq!(event.event_name, "cursor.beforesubmitprompt");
        assert_eq!(event.status_hint, Some(StatusHint::Running));
    }
}
