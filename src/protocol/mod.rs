//! Line-delimited JSON wire protocol: envelopes and the frame codec.

/// Typed command vocabulary carried inside `command` envelopes.
pub mod command;
/// Fan-out event bodies carried inside `stream.event` envelopes.
pub mod event;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::ExitStatus;

pub use command::Command;
pub use event::{EventScope, SessionEvent, StreamEventBody};

/// Envelopes sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClientFrame {
    /// Authenticate the connection. Must be the first frame when the daemon
    /// has a token configured.
    #[serde(rename = "auth")]
    Auth {
        /// Shared secret.
        token: String,
    },

    /// A typed command. Acknowledged with `command.accepted`, then exactly
    /// one of `command.completed` / `command.failed`.
    #[serde(rename = "command", rename_all = "camelCase")]
    Command {
        /// Client-chosen correlation id.
        command_id: String,
        /// The command itself.
        command: Command,
    },

    /// Raw bytes for a session's PTY.
    #[serde(rename = "pty.input", rename_all = "camelCase")]
    PtyInput {
        /// Target session.
        session_id: String,
        /// Base64-encoded bytes.
        data_base64: String,
    },

    /// Resize a session's PTY.
    #[serde(rename = "pty.resize", rename_all = "camelCase")]
    PtyResize {
        /// Target session.
        session_id: String,
        /// New column count.
        cols: u16,
        /// New row count.
        rows: u16,
    },

    /// Deliver a signal to a session's child process.
    #[serde(rename = "pty.signal", rename_all = "camelCase")]
    PtySignal {
        /// Target session.
        session_id: String,
        /// Signal to deliver.
        signal: SignalKind,
    },
}

/// Envelopes sent by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerFrame {
    /// Authentication succeeded.
    #[serde(rename = "auth.ok")]
    AuthOk,

    /// Command received. Ordering barrier only, not success.
    #[serde(rename = "command.accepted", rename_all = "camelCase")]
    CommandAccepted {
        /// Correlation id from the request.
        command_id: String,
    },

    /// Command executed successfully.
    #[serde(rename = "command.completed", rename_all = "camelCase")]
    CommandCompleted {
        /// Correlation id from the request.
        command_id: String,
        /// Command-specific result object.
        result: serde_json::Value,
    },

    /// Command failed.
    #[serde(rename = "command.failed", rename_all = "camelCase")]
    CommandFailed {
        /// Correlation id from the request.
        command_id: String,
        /// Error message; clients match on substrings.
        error: String,
    },

    /// A PTY output chunk for an attached session.
    #[serde(rename = "pty.output", rename_all = "camelCase")]
    PtyOutput {
        /// Source session.
        session_id: String,
        /// Per-session monotonic position of this chunk.
        cursor: u64,
        /// Base64-encoded bytes.
        chunk_base64: String,
    },

    /// A typed session event for an event-subscribed session.
    #[serde(rename = "pty.event", rename_all = "camelCase")]
    PtyEvent {
        /// Source session.
        session_id: String,
        /// The event.
        event: SessionEvent,
    },

    /// The session's child process terminated.
    #[serde(rename = "pty.exit", rename_all = "camelCase")]
    PtyExit {
        /// Source session.
        session_id: String,
        /// Exit outcome.
        exit: ExitStatus,
    },

    /// A fan-out event matching one of the connection's subscriptions.
    #[serde(rename = "stream.event", rename_all = "camelCase")]
    StreamEvent {
        /// Which subscription matched.
        subscription_id: String,
        /// Per-subscription monotonic cursor.
        cursor: u64,
        /// The event body.
        event: StreamEventBody,
    },
}

/// Signals deliverable to a PTY child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// Interrupt (Ctrl+C).
    #[serde(rename = "SIGINT")]
    Int,

    /// Graceful termination request.
    #[serde(rename = "SIGTERM")]
    Term,

    /// Force kill.
    #[serde(rename = "SIGKILL")]
    Kill,
}

impl SignalKind {
    /// Display name matching the wire encoding.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int => "SIGINT",
            Self::Term => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

/// Encode one envelope as a JSON line (including the trailing newline).
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode_frame<T: Serialize>(frame: &T) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Incremental decoder for newline-delimited JSON envelopes.
///
/// Bytes are buffered across reads; a line is parsed only once its newline
/// arrives. Malformed lines are dropped (and counted), never fatal.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    residual: Vec<u8>,
    parse_failures: u64,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes from the transport; returns every complete envelope they
    /// finish. Partial trailing data stays buffered for the next call.
    pub fn push<T: DeserializeOwned>(&mut self, bytes: &[u8]) -> Vec<T> {
        self.residual.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(pos) = self.residual.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.residual.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<T>(line) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    self.parse_failures += 1;
                    tracing::warn!(
                        error = %e,
                        line = %String::from_utf8_lossy(line),
                        "Dropping malformed protocol line"
                    );
                }
            }
        }
        frames
    }

    /// How many malformed lines have been dropped so far.
    #[must_use]
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    /// Bytes currently buffered waiting for a newline.
    #[must_use]
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }
}
