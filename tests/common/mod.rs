//! Shared helpers: boot a daemon on ephemeral ports and drive it over the
//! line-delimited JSON protocol.
#![allow(dead_code)]

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use switchboard::config::DaemonConfig;
use switchboard::server::{Server, ServerHandle};

/// A daemon bound to ephemeral ports with a scratch store.
pub struct TestDaemon {
    pub handle: ServerHandle,
    pub telemetry_base: String,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(customize: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = DaemonConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.telemetry_addr = "127.0.0.1:0".parse().unwrap();
        config.db_path = dir.path().join("state.sqlite3");
        config.notify_dir = dir.path().join("notify");
        customize(&mut config);

        let handle = Server::bind(config).await.expect("daemon bind");
        let telemetry_base = format!(
            "http://127.0.0.1:{}",
            handle.telemetry_addr.port()
        );
        Self {
            handle,
            telemetry_base,
            _dir: dir,
        }
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.handle.local_addr).await
    }
}

/// A protocol client over one TCP connection.
pub struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    next_command: u64,
    /// `stream.event` / `pty.*` frames observed while waiting for replies.
    pub events: Vec<Value>,
}

impl Client {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            next_command: 0,
            events: Vec::new(),
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write newline");
    }

    pub async fn send_frame(&mut self, frame: &Value) {
        self.send_raw(&frame.to_string()).await;
    }

    /// Read the next frame, or None on timeout/disconnect.
    pub async fn next_frame(&mut self, timeout: Duration) -> Option<Value> {
        let mut line = String::new();
        match tokio::time::timeout(timeout, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Err(_) => None,
            Ok(Ok(_)) => Some(serde_json::from_str(line.trim()).expect("server frame is JSON")),
            Ok(Err(_)) => None,
        }
    }

    /// Send a command and wait for its completion, stashing any fan-out
    /// frames seen along the way. Panics unless `command.accepted` arrives
    /// before the final reply. Returns Ok(result) or Err(error string).
    pub async fn command(&mut self, command: Value) -> Result<Value, String> {
        self.next_command += 1;
        let command_id = format!("command-{}", self.next_command);
        let frame = json!({
            "kind": "command",
            "commandId": command_id,
            "command": command,
        });
        self.send_frame(&frame).await;

        let mut accepted = false;
        loop {
            let frame = self
                .next_frame(Duration::from_secs(10))
                .await
                .expect("server reply");
            match frame["kind"].as_str().unwrap_or_default() {
                "command.accepted" if frame["commandId"] == command_id.as_str() => {
                    accepted = true;
                }
                "command.completed" if frame["commandId"] == command_id.as_str() => {
                    assert!(accepted, "completed before accepted");
                    return Ok(frame["result"].clone());
                }
                "command.failed" if frame["commandId"] == command_id.as_str() => {
                    assert!(accepted, "failed before accepted");
                    return Err(frame["error"].as_str().unwrap_or_default().to_string());
                }
                _ => self.events.push(frame),
            }
        }
    }

    /// Collect fan-out frames until `predicate` matches one or the timeout
    /// elapses. Returns the matching frame, if any.
    pub async fn wait_for_event(
        &mut self,
        timeout: Duration,
        predicate: impl Fn(&Value) -> bool,
    ) -> Option<Value> {
        if let Some(found) = self.events.iter().find(|e| predicate(e)).cloned() {
            return Some(found);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())?;
            let frame = self.next_frame(remaining).await?;
            if predicate(&frame) {
                return Some(frame);
            }
            self.events.push(frame);
        }
    }
}

/// Shorthand: a terminal session command that stays alive.
pub fn sleepy_terminal_start(session_id: &str) -> Value {
    json!({
        "type": "pty.start",
        "sessionId": session_id,
        "agentType": "terminal",
        "args": ["-c", "sleep 30"],
        "initialCols": 80,
        "initialRows": 24,
        "telemetry": false,
    })
}
