//! Completion backend: the conversational model behind the bot.
//!
//! The orchestrator only sees `CompletionBackend`. A backend owns each channel's rolling history
//! and persona, and its own history idle timer; the session table knows nothing about either.
//!
//! - `openai`: any OpenAI-compatible `/chat/completions` endpoint.

pub mod openai;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use openai::OpenAiBackend;

/// Role tag of a message in the conversation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Generated answer for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed backend response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("backend returned no choices")]
    EmptyChoices,
}

/// Conversation service used by the orchestrator and the idle monitor.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Append `text` under `role` to the channel's context and generate an answer of at most
    /// `max_tokens`. A failed call leaves the context as it was.
    async fn converse(
        &self,
        channel_id: &str,
        role: Role,
        text: &str,
        max_tokens: u32,
    ) -> Result<Completion, BackendError>;

    /// Install `persona` as the channel's standing system instruction; empty clears it.
    /// Returns the confirmation to show the user.
    async fn set_persona(&self, channel_id: &str, persona: &str) -> String;

    /// Drop the channel's history and persona. Returns the confirmation to show the user.
    async fn end_session(&self, channel_id: &str) -> String;
}
