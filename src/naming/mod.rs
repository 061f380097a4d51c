//! Thread-title namer: debounced prompt history → title via an injectable
//! provider.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentType;
use crate::protocol::event::StreamEventBody;
use crate::router::ScopedEvent;
use crate::store::{StateStore, StoreError};

/// Debounce window after the last prompt before naming runs.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Longest title the fallback provider derives from a prompt.
const FALLBACK_TITLE_LEN: usize = 48;

/// One prompt retained in a thread's naming history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptEntry {
    /// 1-based chronological number.
    pub index: u32,

    /// Prompt text (images already stripped).
    pub text: String,

    /// When the prompt was observed.
    pub observed_at: DateTime<Utc>,

    /// Content hash used to drop exact repeats.
    #[serde(skip)]
    pub content_hash: u64,
}

/// Outcome of `conversation.title.refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TitleRefreshOutcome {
    /// The stored title changed.
    Updated {
        /// The new title.
        title: String,
    },

    /// The provider returned the title already stored.
    Unchanged,

    /// Naming was skipped.
    Skipped {
        /// `non-agent-thread` or `prompt-history-empty`.
        reason: String,
    },
}

/// External naming capability.
#[async_trait]
pub trait TitleProvider: Send + Sync {
    /// Produce a title from the numbered prompt list.
    async fn name_thread(&self, prompts: &[PromptEntry]) -> anyhow::Result<String>;
}

/// Default provider when no endpoint is configured: first prompt, clipped.
#[derive(Debug, Default)]
pub struct FallbackTitleProvider;

#[async_trait]
impl TitleProvider for FallbackTitleProvider {
    async fn name_thread(&self, prompts: &[PromptEntry]) -> anyhow::Result<String> {
        let first = prompts
            .first()
            .ok_or_else(|| anyhow::anyhow!("prompt history empty"))?;
        let mut title: String = first.text.chars().take(FALLBACK_TITLE_LEN).collect();
        if first.text.chars().count() > FALLBACK_TITLE_LEN {
            title.push('…');
        }
        Ok(title)
    }
}

/// HTTP provider: posts the prompt list as JSON, expects `{"title": "..."}`.
pub struct HttpTitleProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpTitleProvider {
    /// Build a provider against a naming endpoint.
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl TitleProvider for HttpTitleProvider {
    async fn name_thread(&self, prompts: &[PromptEntry]) -> anyhow::Result<String> {
        #[derive(serde::Deserialize)]
        struct NameResponse {
            title: String,
        }
        let response: NameResponse = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&serde_json::json!({ "prompts": prompts }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.title)
    }
}

/// The namer: per-thread prompt history plus a cancel-and-reschedule
/// debounce timer.
pub struct TitleNamer {
    provider: Arc<dyn TitleProvider>,
    state: Arc<StateStore>,
    histories: Mutex<HashMap<String, Vec<PromptEntry>>>,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TitleNamer {
    /// Build a namer over the state store.
    #[must_use]
    pub fn new(provider: Arc<dyn TitleProvider>, state: Arc<StateStore>) -> Self {
        Self {
            provider,
            state,
            histories: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Watch prompt events from a router tap until cancelled.
    pub fn spawn(
        namer: Arc<Self>,
        mut tap: mpsc::UnboundedReceiver<ScopedEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = tap.recv() => {
                        let Some(event) = event else { break };
                        if let StreamEventBody::SessionPromptEvent {
                            session_id,
                            index,
                            text,
                            observed_at,
                        } = event.body
                        {
                            Self::record_prompt(&namer, &session_id, index, text, observed_at)
                                .await;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Record a prompt and (re)arm the debounce timer.
    pub async fn record_prompt(
        namer: &Arc<Self>,
        conversation_id: &str,
        index: u32,
        text: String,
        observed_at: DateTime<Utc>,
    ) {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let content_hash = hasher.finish();

        {
            let mut histories = namer.histories.lock().await;
            let history = histories.entry(conversation_id.to_string()).or_default();
            if history.last().is_some_and(|p| p.content_hash == content_hash) {
                return;
            }
            history.push(PromptEntry {
                index,
                text,
                observed_at,
                content_hash,
            });
        }

        // Cancel-and-reschedule: a new prompt drops the pending timer.
        let mut pending = namer.pending.lock().await;
        if let Some(previous) = pending.remove(conversation_id) {
            previous.abort();
        }
        let task_namer = Arc::clone(namer);
        let id = conversation_id.to_string();
        pending.insert(
            conversation_id.to_string(),
            tokio::spawn(async move {
                tokio::time::sleep(DEBOUNCE).await;
                if let Err(e) = task_namer.refresh_title(&id).await {
                    tracing::warn!(conversation_id = %id, error = %e, "Debounced title refresh failed");
                }
            }),
        );
    }

    /// Run naming now for one thread.
    ///
    /// # Errors
    ///
    /// Fails with `thread not found` for unknown threads, or when the
    /// provider call fails.
    pub async fn refresh_title(
        &self,
        conversation_id: &str,
    ) -> Result<TitleRefreshOutcome, anyhow::Error> {
        let conversation = match self.state.conversation(conversation_id).await {
            Ok(conversation) => conversation,
            Err(StoreError::NotFound { .. }) => {
                anyhow::bail!("thread not found: {conversation_id}")
            }
            Err(e) => return Err(e.into()),
        };

        if conversation.agent_type == AgentType::Terminal {
            return Ok(TitleRefreshOutcome::Skipped {
                reason: "non-agent-thread".to_string(),
            });
        }

        let prompts = self
            .histories
            .lock()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        if prompts.is_empty() {
            return Ok(TitleRefreshOutcome::Skipped {
                reason: "prompt-history-empty".to_string(),
            });
        }

        let title = self.provider.name_thread(&prompts).await?;
        let changed = self
            .state
            .set_conversation_title(conversation_id, &title)
            .await?;
        if changed {
            Ok(TitleRefreshOutcome::Updated { title })
        } else {
            Ok(TitleRefreshOutcome::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Scope;
    use crate::router::SubscriptionRouter;
    use crate::store::SqliteStore;

    struct FixedProvider(String);

    #[async_trait]
    impl TitleProvider for FixedProvider {
        async fn name_thread(&self, _prompts: &[PromptEntry]) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    async fn fixture(agent: AgentType, title: &str) -> (Arc<StateStore>, Arc<TitleNamer>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let router = Arc::new(SubscriptionRouter::new());
        let state = Arc::new(StateStore::new(store, router, Scope::default()));
        state
            .create_conversation(Some("conversation-1".into()), None, None, agent)
            .await
            .unwrap();
        let namer = Arc::new(TitleNamer::new(
            Arc::new(FixedProvider(title.to_string())),
            Arc::clone(&state),
        ));
        (state, namer)
    }

    #[tokio::test]
    async fn test_refresh_skips_empty_history() {
        let (_state, namer) = fixture(AgentType::Claude, "a title").await;
        let outcome = namer.refresh_title("conversation-1").await.unwrap();
        assert_eq!(
            outcome,
            TitleRefreshOutcome::Skipped {
                reason: "prompt-history-empty".into()
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_skips_terminal_threads() {
        let (_state, namer) = fixture(AgentType::Terminal, "a title").await;
        TitleNamer::record_prompt(&namer, "conversation-1", 1, "ls -la".into(), Utc::now())
            .await;
        let outcome = namer.refresh_title("conversation-1").await.unwrap();
        assert_eq!(
            outcome,
            TitleRefreshOutcome::Skipped {
                reason: "non-agent-thread".into()
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_updates_then_reports_unchanged() {
        let (state, namer) = fixture(AgentType::Claude, "fix the parser").await;
        TitleNamer::record_prompt(
            &namer,
            "conversation-1",
            1,
            "please fix the parser".into(),
            Utc::now(),
        )
        .await;

        let outcome = namer.refresh_title("conversation-1").await.unwrap();
        assert_eq!(
            outcome,
            TitleRefreshOutcome::Updated {
                title: "fix the parser".into()
            }
        );
        assert_eq!(
            state.conversation("conversation-1").await.unwrap().title,
            "fix the parser"
        );

        let again = namer.refresh_title("conversation-1").await.unwrap();
        assert_eq!(again, TitleRefreshOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_unknown_thread_fails() {
        let (_state, namer) = fixture(AgentType::Claude, "t").await;
        let err = namer.refresh_title("conversation-ghost").await.unwrap_err();
        assert!(err.to_string().contains("thread not found"));
    }

    #[tokio::test]
    async fn test_duplicate_prompts_deduped_by_hash() {
        let (_state, namer) = fixture(AgentType::Claude, "t").await;
        TitleNamer::record_prompt(&namer, "conversation-1", 1, "same".into(), Utc::now())
            .await;
        TitleNamer::record_prompt(&namer, "conversation-1", 2, "same".into(), Utc::now())
            .await;
        let histories = namer.histories.lock().await;
        assert_eq!(histories.get("conversation-1").unwrap().len(), 1);
    }

    #[test]
    fn test_fallback_provider_clips_long_prompts() {
        let provider = FallbackTitleProvider;
        let prompts = vec![PromptEntry {
            index: 1,
            text: "x".repeat(100),
            observed_at: Utc::now(),
            content_hash: 0,
        }];
        let title = tokio_test::block_on(provider.name_thread(&prompts)).unwrap();
        assert!(title.chars().count() <= FALLBACK_TITLE_LEN + 1);
        assert!(title.ends_with('…'));
    }
}
