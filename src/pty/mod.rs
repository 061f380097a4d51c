//! PTY sessions: a child process on a pseudoterminal with cursor-stamped
//! output chunks, replayable from a retained ring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::ExitStatus;
use crate::protocol::SignalKind;

/// Channel buffer size for write requests.
const WRITE_CHANNEL_SIZE: usize = 256;

/// Channel buffer size for output broadcast.
const OUTPUT_CHANNEL_SIZE: usize = 256;

/// Buffer size for PTY reads.
const READ_BUFFER_SIZE: usize = 4096;

/// Retained output bytes per session for attach replay.
const RING_BYTE_LIMIT: usize = 1 << 20;

/// One output chunk stamped with its per-session cursor.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Per-session monotonic position.
    pub cursor: u64,

    /// Raw bytes read from the PTY.
    pub bytes: Vec<u8>,
}

/// Requests sent to the PTY writer task.
#[derive(Debug)]
enum WriteRequest {
    Bytes(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Default)]
struct ChunkRing {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
}

impl ChunkRing {
    fn push(&mut self, chunk: OutputChunk) {
        self.bytes += chunk.bytes.len();
        self.chunks.push_back(chunk);
        while self.bytes > RING_BYTE_LIMIT {
            if let Some(dropped) = self.chunks.pop_front() {
                self.bytes -= dropped.bytes.len();
            } else {
                break;
            }
        }
    }

    fn replay_after(&self, since: u64) -> Vec<OutputChunk> {
        self.chunks
            .iter()
            .filter(|c| c.cursor > since)
            .cloned()
            .collect()
    }
}

/// A spawned child on a PTY. Owns reader/writer tasks; output is fanned out
/// through a broadcast channel and retained in a ring for replay.
pub struct PtySession {
    session_id: String,
    child_pid: Option<u32>,
    write_tx: mpsc::Sender<WriteRequest>,
    output_tx: broadcast::Sender<OutputChunk>,
    ring: Arc<Mutex<ChunkRing>>,
    cursor: Arc<AtomicU64>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    cancel_token: CancellationToken,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    wait_task: Option<JoinHandle<()>>,
}

impl PtySession {
    /// Spawn `program` with `args`/`env` on a fresh PTY.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY cannot be opened or the child fails to
    /// spawn.
    pub fn spawn(
        session_id: &str,
        program: &str,
        args: &[String],
        env: &[(String, String)],
        cwd: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<Self> {
        let (pty, pts) = pty_process::open()?;

        let mut cmd = pty_process::Command::new(program).args(args);
        for (key, value) in env {
            cmd = cmd.env(key, value);
        }
        if let Some(cwd) = cwd {
            cmd = cmd.current_dir(cwd);
        }
        let mut child = cmd.spawn(pts)?;
        let child_pid = child.id();

        let (pty_reader, pty_writer) = pty.into_split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
        // Apply the initial size through the writer task.
        let _ = write_tx.try_send(WriteRequest::Resize { cols, rows });
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_SIZE);
        let (exit_tx, exit_rx) = watch::channel(None);
        let ring = Arc::new(Mutex::new(ChunkRing::default()));
        let cursor = Arc::new(AtomicU64::new(0));
        let cancel_token = CancellationToken::new();

        let reader_task = {
            let ring = Arc::clone(&ring);
            let cursor = Arc::clone(&cursor);
            let output_tx = output_tx.clone();
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move {
                Self::reader_loop(pty_reader, ring, cursor, output_tx, cancel_token).await;
            })
        };

        let writer_task = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move {
                Self::writer_loop(pty_writer, write_rx, cancel_token).await;
            })
        };

        let wait_task = {
            let cancel_token = cancel_token.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                let exit = match child.wait().await {
                    Ok(status) => exit_status_of(&status),
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "PTY child wait failed");
                        ExitStatus::default()
                    }
                };
                let _ = exit_tx.send(Some(exit));
                // Give the reader a moment to drain trailing output.
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                cancel_token.cancel();
            })
        };

        Ok(Self {
            session_id: session_id.to_string(),
            child_pid,
            write_tx,
            output_tx,
            ring,
            cursor,
            exit_rx,
            cancel_token,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
            wait_task: Some(wait_task),
        })
    }

    async fn reader_loop(
        mut reader: pty_process::OwnedReadPty,
        ring: Arc<Mutex<ChunkRing>>,
        cursor: Arc<AtomicU64>,
        output_tx: broadcast::Sender<OutputChunk>,
        cancel_token: CancellationToken,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = OutputChunk {
                                cursor: cursor.fetch_add(1, Ordering::SeqCst) + 1,
                                bytes: buf[..n].to_vec(),
                            };
                            ring.lock().await.push(chunk.clone());
                            let _ = output_tx.send(chunk);
                        }
                        // EIO is the normal read error once the child side closes.
                        Err(_) => break,
                    }
                }
                () = cancel_token.cancelled() => break,
            }
        }
    }

    async fn writer_loop(
        mut writer: pty_process::OwnedWritePty,
        mut write_rx: mpsc::Receiver<WriteRequest>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                request = write_rx.recv() => {
                    match request {
                        Some(WriteRequest::Bytes(bytes)) => {
                            if writer.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(WriteRequest::Resize { cols, rows }) => {
                            if writer.resize(pty_process::Size::new(rows, cols)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                () = cancel_token.cancelled() => break,
            }
        }
    }

    /// The session this PTY backs.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// OS pid of the child, when still known.
    #[must_use]
    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Latest emitted output cursor.
    #[must_use]
    pub fn latest_cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Subscribe to live output chunks.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OutputChunk> {
        self.output_tx.subscribe()
    }

    /// Retained chunks with cursor greater than `since`.
    pub async fn replay_after(&self, since: u64) -> Vec<OutputChunk> {
        self.ring.lock().await.replay_after(since)
    }

    /// Watch channel resolving once the child exits.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exit_rx.clone()
    }

    /// Exit status, if the child has already terminated.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_rx.borrow().clone()
    }

    /// Queue bytes for the child's stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if the write channel is closed.
    pub async fn write(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.write_tx
            .send(WriteRequest::Bytes(bytes))
            .await
            .map_err(|_| anyhow::anyhow!("PTY write channel closed"))
    }

    /// Resize the PTY.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let _ = self.write_tx.send(WriteRequest::Resize { cols, rows }).await;
    }

    /// Deliver a signal to the child.
    ///
    /// # Errors
    ///
    /// Returns an error if the child is gone or the signal fails.
    pub fn signal(&self, kind: SignalKind) -> anyhow::Result<()> {
        let pid = self
            .child_pid
            .ok_or_else(|| anyhow::anyhow!("PTY child already reaped"))?;
        let signal = match kind {
            SignalKind::Int => nix::sys::signal::Signal::SIGINT,
            SignalKind::Term => nix::sys::signal::Signal::SIGTERM,
            SignalKind::Kill => nix::sys::signal::Signal::SIGKILL,
        };
        let pid = nix::unistd::Pid::from_raw(i32::try_from(pid)?);
        nix::sys::signal::kill(pid, signal)?;
        Ok(())
    }

    /// Terminate the child and stop the reader/writer tasks.
    pub async fn close(&mut self) {
        if let Some(pid) = self.child_pid {
            if self.exit_status().is_none() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid.try_into().unwrap_or(0)),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        self.cancel_token.cancel();

        let tasks = [
            self.reader_task.take(),
            self.writer_task.take(),
            self.wait_task.take(),
        ];
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            for task in tasks.into_iter().flatten() {
                let _ = task.await;
            }
        })
        .await;
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        for task in [
            self.reader_task.take(),
            self.writer_task.take(),
            self.wait_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

fn exit_status_of(status: &std::process::ExitStatus) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal().map(|s| {
        nix::sys::signal::Signal::try_from(s)
            .map_or_else(|_| format!("SIG{s}"), |sig| sig.to_string())
    });
    ExitStatus {
        code: status.code(),
        signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_reads_output_with_increasing_cursors() {
        let session = PtySession::spawn(
            "conversation-1",
            "sh",
            &["-c".into(), "printf hello-from-pty".into()],
            &[],
            None,
            80,
            24,
        )
        .unwrap();

        let mut rx = session.subscribe();
        let mut collected = Vec::new();
        let mut last_cursor = 0;
        let deadline = tokio::time::Duration::from_secs(5);
        let _ = tokio::time::timeout(deadline, async {
            while let Ok(chunk) = rx.recv().await {
                assert!(chunk.cursor > last_cursor);
                last_cursor = chunk.cursor;
                collected.extend_from_slice(&chunk.bytes);
                if collected.windows(14).any(|w| w == b"hello-from-pty") {
                    break;
                }
            }
        })
        .await;

        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("hello-from-pty"), "got: {text}");
    }

    #[tokio::test]
    async fn test_exit_status_reported() {
        let session = PtySession::spawn(
            "conversation-2",
            "sh",
            &["-c".into(), "exit 3".into()],
            &[],
            None,
            80,
            24,
        )
        .unwrap();

        let mut watch = session.exit_watch();
        let deadline = tokio::time::Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                if watch.borrow().is_some() {
                    break;
                }
                if watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let exit = session.exit_status().unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(exit.signal.is_none());
    }

    #[tokio::test]
    async fn test_replay_after_returns_retained_chunks() {
        let session = PtySession::spawn(
            "conversation-3",
            "sh",
            &["-c".into(), "printf replay-me; sleep 2".into()],
            &[],
            None,
            80,
            24,
        )
        .unwrap();

        // Wait for output to land in the ring.
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
        loop {
            if session.latest_cursor() > 0 || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        let chunks = session.replay_after(0).await;
        assert!(!chunks.is_empty());
        let text: Vec<u8> = chunks.iter().flat_map(|c| c.bytes.clone()).collect();
        assert!(String::from_utf8_lossy(&text).contains("replay-me"));

        let none = session.replay_after(session.latest_cursor()).await;
        assert!(none.is_empty());
    }
}
