//! OpenAI-compatible chat completions backend.
//!
//! Per channel it keeps an optional persona (sent first as a `system` message, never trimmed)
//! and a rolling window of user/assistant messages capped at `history_limit`. Every turn re-arms
//! a history idle timer; when it fires the history and persona are discarded and the channel id
//! is published on the `expired` channel so bindings can follow.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{BackendError, Completion, CompletionBackend, Role, TokenUsage};
use crate::config::CompletionConfig;
use crate::im::log::truncate_content_default;

pub const RESET_DONE: &str = "对话已重置。继续聊天开启新的对话。";
pub const RESET_NOTHING: &str = "没有对话可以重置。请问有其他可以帮助您的吗？";
pub const PERSONA_SET: &str = "好的，新的人设已经记住了。继续聊天就能体验。";
pub const PERSONA_CLEARED: &str = "人设已清除，恢复默认的 YUI。";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Default)]
struct ChannelHistory {
    persona: Option<String>,
    messages: VecDeque<ChatMessage>,
    /// Bumped whenever the history is discarded (reset or expiry). An answer that started under
    /// an older epoch is not recorded.
    epoch: u64,
    timer_generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl ChannelHistory {
    fn is_empty(&self) -> bool {
        self.persona.is_none() && self.messages.is_empty()
    }

    fn discard(&mut self) {
        self.persona = None;
        self.messages.clear();
        self.epoch += 1;
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    history_limit: usize,
    idle_timeout: Option<Duration>,
    histories: Arc<DashMap<String, ChannelHistory>>,
    expired_tx: Option<mpsc::Sender<String>>,
}

impl OpenAiBackend {
    /// `expired_tx` receives the channel id whenever the history idle timer discards a history.
    pub fn new(
        config: &CompletionConfig,
        expired_tx: Option<mpsc::Sender<String>>,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            history_limit: config.history_limit.max(1),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            histories: Arc::new(DashMap::new()),
            expired_tx,
        })
    }

    /// Persona first, then the window, then the new message. Also returns the history epoch the
    /// request was built from; the channel entry is created here if it is new.
    fn build_messages(&self, channel_id: &str, role: Role, text: &str) -> (Vec<ChatMessage>, u64) {
        let history = self.histories.entry(channel_id.to_string()).or_default();
        let mut messages = Vec::with_capacity(history.messages.len() + 2);
        if let Some(persona) = &history.persona {
            messages.push(ChatMessage {
                role: Role::System,
                content: persona.clone(),
            });
        }
        messages.extend(history.messages.iter().cloned());
        messages.push(ChatMessage {
            role,
            content: text.to_string(),
        });
        (messages, history.epoch)
    }

    /// Append one turn unless the history was discarded since `epoch`. Returns whether it did.
    fn record_exchange(&self, channel_id: &str, epoch: u64, asked: ChatMessage, answer: ChatMessage) -> bool {
        let Some(mut history) = self.histories.get_mut(channel_id) else {
            return false;
        };
        if history.epoch != epoch {
            return false;
        }
        history.messages.push_back(asked);
        history.messages.push_back(answer);
        while history.messages.len() > self.history_limit {
            history.messages.pop_front();
        }
        true
    }

    /// (Re)start the channel's history idle timer. The previous timer, if any, is cancelled.
    fn arm_idle_timer(&self, channel_id: &str) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let mut history = self.histories.entry(channel_id.to_string()).or_default();
        history.disarm();
        history.timer_generation += 1;
        let generation = history.timer_generation;

        let histories = Arc::clone(&self.histories);
        let expired_tx = self.expired_tx.clone();
        let channel_id = channel_id.to_string();
        history.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let had_context = match histories.get_mut(&channel_id) {
                Some(mut h) if h.timer_generation == generation => {
                    let had_context = !h.is_empty();
                    h.discard();
                    h.timer = None;
                    had_context
                }
                _ => return,
            };
            if !had_context {
                return;
            }
            tracing::info!(channel_id = %channel_id, "completion history expired");
            if let Some(tx) = expired_tx {
                if tx.send(channel_id.clone()).await.is_err() {
                    tracing::debug!(channel_id = %channel_id, "history expiry listener gone");
                }
            }
        }));
    }

    async fn request(&self, messages: Vec<ChatMessage>, max_tokens: u32) -> Result<Completion, BackendError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens,
        };
        let res = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        let parsed: ChatCompletionResponse = serde_json::from_str(&text)?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(BackendError::EmptyChoices)?;
        Ok(Completion {
            text: choice.message.content,
            usage: parsed.usage,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn converse(
        &self,
        channel_id: &str,
        role: Role,
        text: &str,
        max_tokens: u32,
    ) -> Result<Completion, BackendError> {
        self.arm_idle_timer(channel_id);
        let (messages, epoch) = self.build_messages(channel_id, role, text);
        tracing::debug!(
            channel_id = %channel_id,
            role = %role,
            context_len = messages.len(),
            content = %truncate_content_default(text),
            "completion request"
        );

        let completion = self.request(messages, max_tokens).await?;
        let recorded = self.record_exchange(
            channel_id,
            epoch,
            ChatMessage {
                role,
                content: text.to_string(),
            },
            ChatMessage {
                role: Role::Assistant,
                content: completion.text.clone(),
            },
        );
        if !recorded {
            tracing::info!(channel_id = %channel_id, "history reset while answering, turn not recorded");
        }
        tracing::info!(
            channel_id = %channel_id,
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            content = %truncate_content_default(&completion.text),
            "completion answered"
        );
        Ok(completion)
    }

    async fn set_persona(&self, channel_id: &str, persona: &str) -> String {
        let persona = persona.trim();
        let mut history = self.histories.entry(channel_id.to_string()).or_default();
        if persona.is_empty() {
            history.persona = None;
            tracing::info!(channel_id = %channel_id, "persona cleared");
            PERSONA_CLEARED.to_string()
        } else {
            history.persona = Some(persona.to_string());
            tracing::info!(channel_id = %channel_id, persona = %truncate_content_default(persona), "persona set");
            PERSONA_SET.to_string()
        }
    }

    async fn end_session(&self, channel_id: &str) -> String {
        // the entry stays so answers still in flight see the new epoch
        let Some(mut history) = self.histories.get_mut(channel_id) else {
            return RESET_NOTHING.to_string();
        };
        history.disarm();
        let had_context = !history.is_empty();
        history.discard();
        if had_context {
            tracing::info!(channel_id = %channel_id, "completion history reset");
            RESET_DONE.to_string()
        } else {
            RESET_NOTHING.to_string()
        }
    }
}
