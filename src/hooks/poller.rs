use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::event::{EventScope, SessionEvent, StreamEventBody};
use crate::status::StatusDeriver;
use crate::store::StateStore;
use crate::telemetry::keyevents::extract_prompt;

/// Jitter bounds after a poll that yielded records, in milliseconds.
const ACTIVE_DELAY_MS: (u64, u64) = (550, 1500);

/// Jitter bounds once polls have gone idle, in milliseconds.
const IDLE_DELAY_MS: (u64, u64) = (1200, 2800);

/// Consecutive empty polls before backing off to the idle bounds.
const IDLE_THRESHOLD: u32 = 3;

/// Pick the next poll delay from the jitter schedule.
#[must_use]
pub fn next_delay(consecutive_empty: u32) -> Duration {
    let (lo, hi) = if consecutive_empty >= IDLE_THRESHOLD {
        IDLE_DELAY_MS
    } else {
        ACTIVE_DELAY_MS
    };
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

/// Read complete lines appended past `offset`. Returns the lines and the
/// new offset (stopping at the last newline; a partial tail stays for the
/// next poll). A file shorter than `offset` resets to 0 before reading.
///
/// # Errors
///
/// Returns an error on I/O failure; a missing file reads as empty.
pub async fn drain_new_lines(path: &PathBuf, offset: u64) -> std::io::Result<(Vec<String>, u64)> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), offset)),
        Err(e) => return Err(e),
    };

    let mut offset = offset;
    if metadata.len() < offset {
        // Truncated; restart from the top.
        offset = 0;
    }
    if metadata.len() == offset {
        return Ok((Vec::new(), offset));
    }

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
        return Ok((Vec::new(), offset));
    };
    let consumed = &buf[..=last_newline];
    let lines = consumed
        .split(|&b| b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| String::from_utf8_lossy(l).to_string())
        .collect();
    Ok((lines, offset + last_newline as u64 + 1))
}

/// Spawn a poll task watching one session's notify file until cancelled.
pub fn spawn_notify_poller(
    session_id: String,
    path: PathBuf,
    state: Arc<StateStore>,
    deriver: Arc<StatusDeriver>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut offset: u64 = 0;
        let mut consecutive_empty: u32 = 0;

        loop {
            let (lines, new_offset) = match drain_new_lines(&path, offset).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        path = %path.display(),
                        error = %e,
                        "Notify file poll failed"
                    );
                    (Vec::new(), offset)
                }
            };
            offset = new_offset;

            if lines.is_empty() {
                consecutive_empty = consecutive_empty.saturating_add(1);
            } else {
                consecutive_empty = 0;
                for line in lines {
                    process_record(&session_id, &line, &state, &deriver).await;
                }
            }

            let delay = next_delay(consecutive_empty);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => break,
            }
        }
    })
}

async fn process_record(
    session_id: &str,
    line: &str,
    state: &Arc<StateStore>,
    deriver: &Arc<StatusDeriver>,
) {
    let record: serde_json::Value = match serde_json::from_str(line) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(session_id, error = %e, "Dropping malformed notify record");
            return;
        }
    };

    // Surface the raw record as a typed session event.
    if let Ok(conversation) = state.conversation(session_id).await {
        if !conversation.is_archived() {
            state
                .emit(
                    EventScope::conversation(
                        conversation.scope.clone(),
                        session_id,
                        conversation.directory_id.as_deref(),
                    ),
                    StreamEventBody::SessionEvent {
                        session_id: session_id.to_string(),
                        event: SessionEvent::Notify {
                            record: record.clone(),
                        },
                    },
                )
                .await;
        }
    }

    let Some(event) = super::key_event_from_record(&record) else {
        return;
    };
    let prompt = extract_prompt(&event);
    let observed_at = event.observed_at;

    if let Err(e) = deriver.apply_key_event(session_id, event).await {
        tracing::error!(session_id, error = %e, "Failed to apply hook event");
    }
    if let Some(text) = prompt {
        if let Err(e) = deriver.apply_prompt(session_id, text, observed_at).await {
            tracing::error!(session_id, error = %e, "Failed to emit hook prompt event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_drain_reads_only_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.jsonl");
        std::fs::write(&path, b"{\"a\":1}\n{\"b\":2}\n{\"partial\":").unwrap();

        let (lines, offset) = drain_new_lines(&path.clone(), 0).await.unwrap();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(offset, 16);

        // Completing the partial line yields exactly one more record.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"3}\n").unwrap();
        let (lines, _) = drain_new_lines(&path, offset).await.unwrap();
        assert_eq!(lines, vec!["{\"partial\":3}"]);
    }

    #[tokio::test]
    async fn test_drain_resets_offset_on_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.jsonl");
        std::fs::write(&path, b"{\"a\":1}\n{\"b\":2}\n").unwrap();

        let (_, offset) = drain_new_lines(&path.clone(), 0).await.unwrap();
        assert_eq!(offset, 16);

        // Shrink the file; the next poll starts over from 0.
        std::fs::write(&path, b"{\"c\":3}\n").unwrap();
        let (lines, offset) = drain_new_lines(&path, offset).await.unwrap();
        assert_eq!(lines, vec!["{\"c\":3}"]);
        assert_eq!(offset, 8);
    }

    #[tokio::test]
    async fn test_drain_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.jsonl");
        let (lines, offset) = drain_new_lines(&path, 7).await.unwrap();
        assert!(lines.is_empty());
        assert_eq!(offset, 7);
    }

    #[test]
    fn test_next_delay_respects_jitter_bounds() {
        for _ in 0..64 {
            let active = next_delay(0).as_millis() as u64;
            assert!((ACTIVE_DELAY_MS.0..=ACTIVE_DELAY_MS.1).contains(&active));

            let idle = next_delay(IDLE_THRESHOLD).as_millis() as u64;
            assert!((IDLE_DELAY_MS.0..=IDLE_DELAY_MS.1).contains(&idle));
        }
    }
}
