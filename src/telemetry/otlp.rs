use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// OTLP JSON logs payload (the subset the daemon reads).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsPayload {
    /// Resource batches.
    #[serde(default)]
    pub resource_logs: Vec<ResourceLogs>,
}

/// One resource batch of logs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLogs {
    /// Scope batches.
    #[serde(default)]
    pub scope_logs: Vec<ScopeLogs>,
}

/// One scope batch of logs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLogs {
    /// Log records.
    #[serde(default)]
    pub log_records: Vec<LogRecord>,
}

/// One OTLP log record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Observation time in nanoseconds since epoch (string or number).
    #[serde(default, deserialize_with = "de_unix_nano")]
    pub time_unix_nano: Option<i64>,

    /// Severity text (`INFO`, `ERROR`, ...).
    #[serde(default)]
    pub severity_text: Option<String>,

    /// Record body.
    #[serde(default)]
    pub body: Option<AnyValue>,

    /// Record attributes.
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

/// OTLP JSON metrics payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    /// Resource batches.
    #[serde(default)]
    pub resource_metrics: Vec<ResourceMetrics>,
}

/// One resource batch of metrics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetrics {
    /// Scope batches.
    #[serde(default)]
    pub scope_metrics: Vec<ScopeMetrics>,
}

/// One scope batch of metrics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMetrics {
    /// Metrics.
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

/// One metric with its data points.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    /// Metric name, e.g. `codex.turn.e2e_duration_ms`.
    #[serde(default)]
    pub name: String,

    /// Sum data points.
    #[serde(default)]
    pub sum: Option<DataPoints>,

    /// Gauge data points.
    #[serde(default)]
    pub gauge: Option<DataPoints>,

    /// Histogram data points.
    #[serde(default)]
    pub histogram: Option<DataPoints>,
}

/// Data point collection shared across metric kinds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoints {
    /// The data points.
    #[serde(default)]
    pub data_points: Vec<DataPoint>,
}

/// One metric data point.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    /// Observation time in nanoseconds since epoch.
    #[serde(default, deserialize_with = "de_unix_nano")]
    pub time_unix_nano: Option<i64>,

    /// Point attributes.
    #[serde(default)]
    pub attributes: Vec<KeyValue>,

    /// Double value, when present.
    #[serde(default)]
    pub as_double: Option<f64>,

    /// Int value, when present (OTLP encodes as string).
    #[serde(default)]
    pub as_int: Option<serde_json::Value>,
}

/// OTLP JSON traces payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracesPayload {
    /// Resource batches.
    #[serde(default)]
    pub resource_spans: Vec<ResourceSpans>,
}

/// One resource batch of spans.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    /// Scope batches.
    #[serde(default)]
    pub scope_spans: Vec<ScopeSpans>,
}

/// One scope batch of spans.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSpans {
    /// Spans.
    #[serde(default)]
    pub spans: Vec<Span>,
}

/// One span.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    /// Span name.
    #[serde(default)]
    pub name: String,

    /// Start time in nanoseconds since epoch.
    #[serde(default, deserialize_with = "de_unix_nano")]
    pub start_time_unix_nano: Option<i64>,

    /// Span attributes.
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

/// OTLP attribute key/value pair.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    /// Attribute key.
    #[serde(default)]
    pub key: String,

    /// Attribute value.
    #[serde(default)]
    pub value: AnyValue,
}

/// OTLP any-value. Only the variants the daemon reads are modeled.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    /// String variant.
    #[serde(default)]
    pub string_value: Option<String>,

    /// Int variant (OTLP encodes as string).
    #[serde(default)]
    pub int_value: Option<serde_json::Value>,

    /// Double variant.
    #[serde(default)]
    pub double_value: Option<f64>,

    /// Bool variant.
    #[serde(default)]
    pub bool_value: Option<bool>,
}

impl AnyValue {
    /// Render the value as a display string, if it has one.
    #[must_use]
    pub fn as_display(&self) -> Option<String> {
        if let Some(s) = &self.string_value {
            return Some(s.clone());
        }
        if let Some(i) = &self.int_value {
            return Some(match i {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        if let Some(d) = self.double_value {
            return Some(d.to_string());
        }
        self.bool_value.map(|b| b.to_string())
    }
}

/// Look up an attribute by key.
#[must_use]
pub fn attribute<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a AnyValue> {
    attributes.iter().find(|kv| kv.key == key).map(|kv| &kv.value)
}

/// Convert OTLP nanoseconds-since-epoch to a UTC timestamp, defaulting to
/// now when absent or out of range.
#[must_use]
pub fn nano_to_utc(nanos: Option<i64>) -> DateTime<Utc> {
    match nanos {
        Some(n) if n > 0 => match Utc.timestamp_opt(n / 1_000_000_000, (n % 1_000_000_000) as u32) {
            chrono::offset::LocalResult::Single(ts) => ts,
            _ => Utc::now(),
        },
        _ => Utc::now(),
    }
}

fn de_unix_nano<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s.parse::<i64>().ok(),
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_string_and_numeric_nanos() {
        let json = r#"{"resourceLogs":[{"scopeLogs":[{"logRecords":[
            {"timeUnixNano":"1700000000000000000","severityText":"INFO"},
            {"timeUnixNano":1700000000000000000}
        ]}]}]}"#;
        let payload: LogsPayload = serde_json::from_str(json).unwrap();
        let records = &payload.resource_logs[0].scope_logs[0].log_records;
        assert_eq!(records[0].time_unix_nano, Some(1_700_000_000_000_000_000));
        assert_eq!(records[1].time_unix_nano, Some(1_700_000_000_000_000_000));
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let payload: LogsPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.resource_logs.is_empty());
    }

    #[test]
    fn test_attribute_lookup() {
        let attrs = vec![KeyValue {
            key: "event.name".into(),
            value: AnyValue {
                string_value: Some("codex.user_prompt".into()),
                ..AnyValue::default()
            },
        }];
        assert_eq!(
            attribute(&attrs, "event.name").unwrap().as_display().unwrap(),
            "codex.user_prompt"
        );
        assert!(attribute(&attrs, "missing").is_none());
    }
}
