//! OTLP ingest end-to-end: token routing, status derivation, fan-out
//! ordering, and HTTP edge cases.

mod common;

use std::time::Duration;

use serde_json::json;

use common::TestDaemon;

fn logs_body(event_name: &str, body: &str, nanos: i64, thread_id: Option<&str>) -> serde_json::Value {
    let mut attributes = vec![json!({
        "key": "event.name",
        "value": { "stringValue": event_name },
    })];
    if let Some(thread_id) = thread_id {
        attributes.push(json!({
            "key": "thread-id",
            "value": { "stringValue": thread_id },
        }));
    }
    json!({
        "resourceLogs": [{
            "scopeLogs": [{
                "logRecords": [{
                    "timeUnixNano": nanos.to_string(),
                    "severityText": "INFO",
                    "body": { "stringValue": body },
                    "attributes": attributes,
                }]
            }]
        }]
    })
}

fn metrics_body(name: &str, nanos: i64) -> serde_json::Value {
    json!({
        "resourceMetrics": [{
            "scopeMetrics": [{
                "metrics": [{
                    "name": name,
                    "sum": { "dataPoints": [{
                        "timeUnixNano": nanos.to_string(),
                        "asDouble": 512.0,
                    }]}
                }]
            }]
        }]
    })
}

#[tokio::test]
async fn test_codex_status_sequence() {
    let daemon = TestDaemon::spawn().await;
    let mut client = daemon.client().await;
    let http = reqwest::Client::new();

    client
        .command(json!({
            "type": "conversation.create",
            "conversationId": "conversation-status-1",
            "agentType": "codex",
        }))
        .await
        .unwrap();
    client
        .command(json!({
            "type": "stream.subscribe",
            "conversationId": "conversation-status-1",
        }))
        .await
        .unwrap();

    let token = daemon.handle.daemon.tokens.mint("conversation-status-1");
    let t0: i64 = 1_700_000_000_000_000_000;

    let response = http
        .post(format!("{}/v1/logs/{token}", daemon.telemetry_base))
        .json(&logs_body(
            "codex.user_prompt",
            "prompt accepted",
            t0,
            Some("thread-codex-1"),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // session-status{running} arrives before the key event that caused it.
    let running = client
        .wait_for_event(Duration::from_secs(5), |frame| {
            frame["event"]["type"] == "session-status"
        })
        .await
        .expect("running status");
    assert_eq!(running["event"]["status"], "running");

    let key_event = client
        .wait_for_event(Duration::from_secs(5), |frame| {
            frame["event"]["type"] == "session-key-event"
        })
        .await
        .expect("key event");
    assert_eq!(key_event["event"]["keyEvent"]["eventName"], "codex.user_prompt");

    // Terminal turn metric 500ms later flips the session to completed.
    let response = http
        .post(format!("{}/v1/metrics/{token}", daemon.telemetry_base))
        .json(&metrics_body(
            "codex.turn.e2e_duration_ms",
            t0 + 500_000_000,
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let completed = client
        .wait_for_event(Duration::from_secs(5), |frame| {
            frame["event"]["type"] == "session-status" && frame["event"]["status"] == "completed"
        })
        .await
        .expect("completed status");
    assert_eq!(completed["event"]["sessionId"], "conversation-status-1");

    client
        .wait_for_event(Duration::from_secs(5), |frame| {
            frame["event"]["type"] == "session-key-event"
                && frame["event"]["keyEvent"]["eventName"] == "codex.turn.e2e_duration_ms"
        })
        .await
        .expect("turn duration key event");

    // The observed thread id landed in the codex adapter slot.
    let conversation = daemon
        .handle
        .daemon
        .state
        .conversation("conversation-status-1")
        .await
        .unwrap();
    assert_eq!(
        conversation
            .adapter_state
            .codex
            .unwrap()
            .resume_session_id
            .as_deref(),
        Some("thread-codex-1")
    );

    daemon.handle.shutdown().await;
}

#[tokio::test]
async fn test_prompt_event_emitted_with_images_stripped() {
    let daemon = TestDaemon::spawn().await;
    let mut client = daemon.client().await;

    client
        .command(json!({
            "type": "conversation.create",
            "conversationId": "conversation-prompt-1",
            "agentType": "codex",
        }))
        .await
        .unwrap();
    client
        .command(json!({
            "type": "stream.subscribe",
            "conversationId": "conversation-prompt-1",
        }))
        .await
        .unwrap();

    let token = daemon.handle.daemon.tokens.mint("conversation-prompt-1");
    let mut body = logs_body("codex.user_prompt", "", 1_700_000_000_000_000_000, None);
    body["resourceLogs"][0]["scopeLogs"][0]["logRecords"][0]["attributes"]
        .as_array_mut()
        .unwrap()
        .push(json!({
            "key": "prompt",
            "value": { "stringValue": "fix the ![screenshot](http://x/s.png) bug" },
        }));

    reqwest::Client::new()
        .post(format!("{}/v1/logs/{token}", daemon.telemetry_base))
        .json(&body)
        .send()
        .await
        .unwrap();

    let prompt = client
        .wait_for_event(Duration::from_secs(5), |frame| {
            frame["event"]["type"] == "session-prompt-event"
        })
        .await
        .expect("prompt event");
    assert_eq!(prompt["event"]["index"], 1);
    assert_eq!(prompt["event"]["text"], "fix the bug");

    daemon.handle.shutdown().await;
}

#[tokio::test]
async fn test_http_edges() {
    let daemon = TestDaemon::spawn().await;
    let mut client = daemon.client().await;
    let http = reqwest::Client::new();

    client
        .command(json!({
            "type": "conversation.create",
            "conversationId": "conversation-edge",
            "agentType": "codex",
        }))
        .await
        .unwrap();
    let token = daemon.handle.daemon.tokens.mint("conversation-edge");

    // Unknown token → 404.
    let response = http
        .post(format!("{}/v1/logs/not-a-token", daemon.telemetry_base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Wrong method → 405.
    let response = http
        .get(format!("{}/v1/logs/{token}", daemon.telemetry_base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    // Invalid JSON body → 400.
    let response = http
        .post(format!("{}/v1/logs/{token}", daemon.telemetry_base))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Empty resource batch → 200, zero key events.
    client
        .command(json!({
            "type": "stream.subscribe",
            "conversationId": "conversation-edge",
        }))
        .await
        .unwrap();
    let response = http
        .post(format!("{}/v1/logs/{token}", daemon.telemetry_base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let event = client
        .wait_for_event(Duration::from_secs(2), |frame| {
            frame["event"]["type"] == "session-key-event"
        })
        .await;
    assert!(event.is_none(), "empty batch produced a key event");

    daemon.handle.shutdown().await;
}

#[tokio::test]
async fn test_verbose_deltas_suppressed_by_default() {
    let daemon = TestDaemon::spawn().await;
    let mut client = daemon.client().await;
    let http = reqwest::Client::new();

    client
        .command(json!({
            "type": "conversation.create",
            "conversationId": "conversation-verbose",
            "agentType": "codex",
        }))
        .await
        .unwrap();
    client
        .command(json!({
            "type": "stream.subscribe",
            "conversationId": "conversation-verbose",
        }))
        .await
        .unwrap();

    let token = daemon.handle.daemon.tokens.mint("conversation-verbose");
    let response = http
        .post(format!("{}/v1/logs/{token}", daemon.telemetry_base))
        .json(&logs_body(
            "codex.sse_event",
            "response.output_text.delta",
            1_700_000_000_000_000_000,
            None,
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let event = client
        .wait_for_event(Duration::from_secs(2), |frame| {
            frame["event"]["type"] == "session-key-event"
        })
        .await;
    assert!(event.is_none(), "verbose delta leaked into fan-out");

    daemon.handle.shutdown().await;
}
