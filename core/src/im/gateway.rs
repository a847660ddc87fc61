//! Messaging gateway abstraction: what the orchestrator needs from the chat platform.
//! Send to a channel, send a direct message, and add/remove a reaction on a message.
//! The concrete platform (KOOK) lives in `channels::kook`.

use async_trait::async_trait;

/// Error from a gateway call. The orchestrator logs these and carries on.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// API returned 429; retry after this many seconds.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    /// Platform answered with a non-zero business code.
    #[error("api error code={code}: {message}")]
    Api { code: i64, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// One inbound chat message, already normalized by the platform adapter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundEvent {
    pub message_id: String,
    pub author_id: String,
    pub author_is_bot: bool,
    /// Channel id for channel messages, the bot's own id for direct messages.
    pub target_id: String,
    pub is_direct: bool,
    /// Trimmed text with mention markup removed.
    pub text: String,
    pub mentioned_user_ids: Vec<String>,
}

impl InboundEvent {
    pub fn mentions(&self, user_id: &str) -> bool {
        self.mentioned_user_ids.iter().any(|id| id == user_id)
    }
}

/// Outbound side of the chat platform. Implemented per platform; doubles in tests.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Post `text` in a channel. Returns the new message id.
    async fn send_channel_message(&self, channel_id: &str, text: &str) -> Result<String, GatewayError>;

    /// Send `text` privately to a user. Returns the new message id.
    async fn send_direct_message(&self, user_id: &str, text: &str) -> Result<String, GatewayError>;

    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<(), GatewayError>;

    /// Remove the reaction `emoji` that `user_id` put on the message.
    async fn remove_reaction(&self, message_id: &str, emoji: &str, user_id: &str) -> Result<(), GatewayError>;
}
