use crate::core::keyevent::{KeyEvent, KeyEventSource, StatusHint};

use super::otlp::{self, LogRecord, LogsPayload, MetricsPayload, Span, TracesPayload, attribute};

/// Event names that signal the agent started or resumed working.
const RUNNING_EVENTS: &[&str] = &[
    "codex.user_prompt",
    "claude.userpromptsubmit",
    "claude.pretooluse",
    "cursor.beforesubmitprompt",
    "cursor.beforeshellexecution",
    "cursor.beforemcptool",
];

/// Event names that terminate a turn.
const COMPLETED_EVENTS: &[&str] = &[
    "codex.turn.e2e_duration_ms",
    "claude.stop",
    "claude.subagentstop",
    "claude.sessionend",
    "cursor.stop",
    "cursor.sessionend",
];

/// Attribute keys that may carry the provider-side thread id.
const THREAD_ID_KEYS: &[&str] = &["thread-id", "thread_id", "session_id", "session.id"];

/// Event names whose payload carries a user prompt.
const PROMPT_EVENTS: &[&str] = &[
    "codex.user_prompt",
    "claude.userpromptsubmit",
    "cursor.beforesubmitprompt",
];

/// Classify an event name (plus payload, for notifications) into a status
/// hint.
#[must_use]
pub fn classify(event_name: &str, summary: &str, payload: &serde_json::Value) -> Option<StatusHint> {
    if RUNNING_EVENTS.contains(&event_name) {
        return Some(StatusHint::Running);
    }
    if COMPLETED_EVENTS.contains(&event_name) {
        return Some(StatusHint::Completed);
    }
    if event_name == "codex.sse_event" && summary.contains("response.completed") {
        return Some(StatusHint::Completed);
    }
    if event_name == "claude.notification" {
        let kind = payload
            .get("notification_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if kind.contains("approval") || kind.contains("permission") {
            return Some(StatusHint::NeedsInput);
        }
    }
    None
}

/// Whether a key event's payload carries an extractable user prompt.
#[must_use]
pub fn extract_prompt(event: &KeyEvent) -> Option<String> {
    if !PROMPT_EVENTS.contains(&event.event_name.as_str()) {
        return None;
    }
    let text = event
        .payload
        .get("prompt")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .or_else(|| {
            // codex puts the prompt text in the log body.
            if event.event_name == "codex.user_prompt" && !event.summary.is_empty() {
                Some(event.summary.clone())
            } else {
                None
            }
        })?;
    let stripped = strip_images(&text);
    if stripped.is_empty() {
        None
    } else {
        Some(stripped)
    }
}

/// Strip markdown image syntax and bracketed image attachments from a
/// prompt, collapsing the surrounding whitespace.
#[must_use]
pub fn strip_images(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        // Markdown image: ![alt](url)
        if c == '!' && text[i..].starts_with("![") {
            if let Some(close) = text[i..].find(']') {
                let after = i + close + 1;
                if text[after..].starts_with('(') {
                    if let Some(paren) = text[after..].find(')') {
                        let end = after + paren + 1;
                        while chars.peek().is_some_and(|(j, _)| *j < end) {
                            chars.next();
                        }
                        continue;
                    }
                }
            }
        }
        // Attachment placeholder: [image ...] / [image: ...]
        if c == '[' && text[i + 1..].to_lowercase().starts_with("image") {
            if let Some(close) = text[i..].find(']') {
                let end = i + close + 1;
                while chars.peek().is_some_and(|(j, _)| *j < end) {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Derive key events from an OTLP logs payload.
#[must_use]
pub fn events_from_logs(payload: &LogsPayload) -> Vec<KeyEvent> {
    payload
        .resource_logs
        .iter()
        .flat_map(|r| &r.scope_logs)
        .flat_map(|s| &s.log_records)
        .filter_map(event_from_log_record)
        .collect()
}

fn event_from_log_record(record: &LogRecord) -> Option<KeyEvent> {
    let event_name = attribute(&record.attributes, "event.name")?
        .as_display()?;
    let summary = record
        .body
        .as_ref()
        .and_then(otlp::AnyValue::as_display)
        .unwrap_or_else(|| event_name.clone());

    let mut payload = serde_json::Map::new();
    for kv in &record.attributes {
        if let Some(value) = kv.value.as_display() {
            payload.insert(kv.key.clone(), serde_json::Value::String(value));
        }
    }
    let payload = serde_json::Value::Object(payload);

    let provider_thread_id = THREAD_ID_KEYS
        .iter()
        .find_map(|key| attribute(&record.attributes, key))
        .and_then(otlp::AnyValue::as_display);

    Some(KeyEvent {
        source: KeyEventSource::Otlp,
        observed_at: otlp::nano_to_utc(record.time_unix_nano),
        status_hint: classify(&event_name, &summary, &payload),
        event_name,
        severity: record.severity_text.clone(),
        summary,
        provider_thread_id,
        payload,
    })
}

/// Derive key events from an OTLP metrics payload. Each data point of a
/// named metric becomes one event.
#[must_use]
pub fn events_from_metrics(payload: &MetricsPayload) -> Vec<KeyEvent> {
    let mut events = Vec::new();
    for metric in payload
        .resource_metrics
        .iter()
        .flat_map(|r| &r.scope_metrics)
        .flat_map(|s| &s.metrics)
    {
        if metric.name.is_empty() {
            continue;
        }
        let points = [&metric.sum, &metric.gauge, &metric.histogram]
            .into_iter()
            .flatten()
            .flat_map(|d| &d.data_points);
        for point in points {
            let mut payload = serde_json::Map::new();
            for kv in &point.attributes {
                if let Some(value) = kv.value.as_display() {
                    payload.insert(kv.key.clone(), serde_json::Value::String(value));
                }
            }
            if let Some(v) = point.as_double {
                payload.insert("value".into(), serde_json::json!(v));
            } else if let Some(v) = &point.as_int {
                payload.insert("value".into(), v.clone());
            }
            let payload = serde_json::Value::Object(payload);

            let provider_thread_id = THREAD_ID_KEYS
                .iter()
                .find_map(|key| attribute(&point.attributes, key))
                .and_then(otlp::AnyValue::as_display);

            events.push(KeyEvent {
                source: KeyEventSource::Otlp,
                observed_at: otlp::nano_to_utc(point.time_unix_nano),
                status_hint: classify(&metric.name, &metric.name, &payload),
                event_name: metric.name.clone(),
                severity: None,
                summary: metric.name.clone(),
                provider_thread_id,
                payload,
            });
        }
    }
    events
}

/// Derive key events from an OTLP traces payload.
#[must_use]
pub fn events_from_traces(payload: &TracesPayload) -> Vec<KeyEvent> {
    payload
        .resource_spans
        .iter()
        .flat_map(|r| &r.scope_spans)
        .flat_map(|s| &s.spans)
        .filter_map(event_from_span)
        .collect()
}

fn event_from_span(span: &Span) -> Option<KeyEvent> {
    if span.name.is_empty() {
        return None;
    }
    let mut payload = serde_json::Map::new();
    for kv in &span.attributes {
        if let Some(value) = kv.value.as_display() {
            payload.insert(kv.key.clone(), serde_json::Value::String(value));
        }
    }
    let payload = serde_json::Value::Object(payload);

    Some(KeyEvent {
        source: KeyEventSource::Otlp,
        observed_at: otlp::nano_to_utc(span.start_time_unix_nano),
        status_hint: classify(&span.name, &span.name, &payload),
        event_name: span.name.clone(),
        severity: None,
        summary: span.name.clone(),
        provider_thread_id: THREAD_ID_KEYS
            .iter()
            .find_map(|key| attribute(&span.attributes, key))
            .and_then(otlp::AnyValue::as_display),
        payload,
    })
}
