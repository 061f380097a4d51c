//! Hook notify bridge end-to-end: JSONL records land in the same pipeline
//! as OTLP and drive the status projection.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::TestDaemon;
use switchboard::hooks::poller::spawn_notify_poller;

#[tokio::test]
async fn test_claude_hook_record_drives_status_and_adapter_state() {
    let daemon = TestDaemon::spawn().await;
    let mut client = daemon.client().await;

    client
        .command(json!({
            "type": "conversation.create",
            "conversationId": "conversation-hook-1",
            "agentType": "claude",
        }))
        .await
        .unwrap();
    client
        .command(json!({
            "type": "stream.subscribe",
            "conversationId": "conversation-hook-1",
        }))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let notify_path = dir.path().join("conversation-hook-1.jsonl");
    let cancel = CancellationToken::new();
    spawn_notify_poller(
        "conversation-hook-1".to_string(),
        notify_path.clone(),
        Arc::clone(&daemon.handle.daemon.state),
        Arc::clone(&daemon.handle.daemon.deriver),
        cancel.clone(),
    );

    // Append a Claude hook record the way a hook command would.
    {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&notify_path)
            .unwrap();
        writeln!(
            file,
            "{}",
            json!({
                "hook_event_name": "UserPromptSubmit",
                "prompt": "improve prompt capture parity",
                "session_id": "claude-session-123",
            })
        )
        .unwrap();
    }

    // The poller picks the record up within its jitter window.
    let running = client
        .wait_for_event(Duration::from_secs(10), |frame| {
            frame["event"]["type"] == "session-status" && frame["event"]["status"] == "running"
        })
        .await
        .expect("running status from hook");
    assert_eq!(running["event"]["sessionId"], "conversation-hook-1");

    let key_event = client
        .wait_for_event(Duration::from_secs(10), |frame| {
            frame["event"]["type"] == "session-key-event"
        })
        .await
        .expect("hook key event");
    assert_eq!(
        key_event["event"]["keyEvent"]["eventName"],
        "claude.userpromptsubmit"
    );

    // The raw record surfaced as a typed notify session event too.
    client
        .wait_for_event(Duration::from_secs(10), |frame| {
            frame["event"]["type"] == "session-event"
                && frame["event"]["event"]["type"] == "notify"
        })
        .await
        .expect("notify session event");

    let conversation = daemon
        .handle
        .daemon
        .state
        .conversation("conversation-hook-1")
        .await
        .unwrap();
    assert_eq!(
        conversation
            .adapter_state
            .claude
            .unwrap()
            .resume_session_id
            .as_deref(),
        Some("claude-session-123")
    );

    cancel.cancel();
    daemon.handle.shutdown().await;
}

#[tokio::test]
async fn test_cursor_stop_completes_session() {
    let daemon = TestDaemon::spawn().await;
    let mut client = daemon.client().await;

    client
        .command(json!({
            "type": "conversation.create",
            "conversationId": "conversation-hook-2",
            "agentType": "cursor",
        }))
        .await
        .unwrap();
    client
        .command(json!({
            "type": "stream.subscribe",
            "conversationId": "conversation-hook-2",
        }))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let notify_path = dir.path().join("conversation-hook-2.jsonl");
    let cancel = CancellationToken::new();
    spawn_notify_poller(
        "conversation-hook-2".to_string(),
        notify_path.clone(),
        Arc::clone(&daemon.handle.daemon.state),
        Arc::clone(&daemon.handle.daemon.deriver),
        cancel.clone(),
    );

    {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&notify_path)
            .unwrap();
        writeln!(
            file,
            "{}",
            json!({ "hook_event_name": "beforeSubmitPrompt", "prompt": "go" })
        )
        .unwrap();
        writeln!(
            file,
            "{}",
            json!({ "hook_event_name": "stop", "final_status": "aborted" })
        )
        .unwrap();
    }

    // Aborted stop still lands the session in completed.
    client
        .wait_for_event(Duration::from_secs(10), |frame| {
            frame["event"]["type"] == "session-status" && frame["event"]["status"] == "completed"
        })
        .await
        .expect("completed status from cursor stop");

    cancel.cancel();
    daemon.handle.shutdown().await;
}
