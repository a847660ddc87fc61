//! KOOK IM: HTTP API with `Authorization: Bot <token>`, webhook for events.
//! Send via api/v3 message/create and direct-message/create (KMarkdown), reactions via
//! message/add-reaction and message/delete-reaction. Receive via webhook: WEBHOOK_CHALLENGE
//! verification plus text/KMarkdown message events. Configure the callback URL with
//! `?compress=0` and leave the encrypt key empty; compressed or encrypted bodies are not decoded.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::KookConfig;
use crate::im::gateway::{GatewayError, InboundEvent, MessagingGateway};
use crate::im::log::truncate_content_default;

/// KOOK message type for KMarkdown.
const KMARKDOWN: u8 = 9;
const TEXT: i64 = 1;
const SYSTEM: i64 = 255;

/// Envelope of every KOOK API response.
#[derive(Debug, Deserialize)]
struct KookResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
struct MessageCreate<'a> {
    #[serde(rename = "type")]
    ty: u8,
    target_id: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct Reaction<'a> {
    msg_id: &'a str,
    emoji: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<&'a str>,
}

/// KOOK gateway. All KOOK HTTP calls stay inside this module.
pub struct KookGateway {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl KookGateway {
    pub fn new(config: &KookConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    async fn unwrap_response(res: reqwest::Response) -> Result<Value, GatewayError> {
        if res.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = res
                .headers()
                .get("X-Rate-Limit-Reset")
                .or_else(|| res.headers().get("Retry-After"))
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(1.0);
            return Err(GatewayError::RateLimited { retry_after_secs });
        }
        let text = res.text().await?;
        let body: KookResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Decode(format!("{}: {}", e, truncate_content_default(&text))))?;
        if body.code != 0 {
            return Err(GatewayError::Api {
                code: body.code,
                message: body.message,
            });
        }
        Ok(body.data)
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Value, GatewayError> {
        let res = self
            .client
            .post(self.url(path))
            .header("Authorization", format!("Bot {}", self.token))
            .json(body)
            .send()
            .await?;
        Self::unwrap_response(res).await
    }

    async fn create_message(&self, path: &str, target_id: &str, text: &str) -> Result<String, GatewayError> {
        let data = self
            .post(
                path,
                &MessageCreate {
                    ty: KMARKDOWN,
                    target_id,
                    content: text,
                },
            )
            .await?;
        data.get("msg_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| GatewayError::Decode("response missing data.msg_id".into()))
    }

    /// Resolve the bot's own user id (GET user/me).
    pub async fn bot_user_id(&self) -> Result<String, GatewayError> {
        let res = self
            .client
            .get(self.url("user/me"))
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await?;
        let data = Self::unwrap_response(res).await?;
        data.get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| GatewayError::Decode("response missing data.id".into()))
    }
}

#[async_trait]
impl MessagingGateway for KookGateway {
    async fn send_channel_message(&self, channel_id: &str, text: &str) -> Result<String, GatewayError> {
        self.create_message("message/create", channel_id, text).await
    }

    async fn send_direct_message(&self, user_id: &str, text: &str) -> Result<String, GatewayError> {
        self.create_message("direct-message/create", user_id, text).await
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str) -> Result<(), GatewayError> {
        self.post(
            "message/add-reaction",
            &Reaction {
                msg_id: message_id,
                emoji,
                user_id: None,
            },
        )
        .await
        .map(|_| ())
    }

    async fn remove_reaction(&self, message_id: &str, emoji: &str, user_id: &str) -> Result<(), GatewayError> {
        self.post(
            "message/delete-reaction",
            &Reaction {
                msg_id: message_id,
                emoji,
                user_id: Some(user_id),
            },
        )
        .await
        .map(|_| ())
    }
}

/// What a webhook body asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookKind {
    /// URL verification: echo the challenge back.
    Challenge(String),
    Message(InboundEvent),
    /// Any other event (joins, reactions, card buttons...). Acknowledged and ignored.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookPayload {
    pub verify_token: Option<String>,
    pub kind: WebhookKind,
}

/// Remove the bot's own `(met)id(met)` mention and trim. Mentions of other users stay.
pub fn strip_bot_mention(content: &str, bot_id: &str) -> String {
    content.replace(&format!("(met){}(met)", bot_id), "").trim().to_string()
}

/// Parse a decoded webhook body `{ "s": 0, "d": { ... } }`. `None` when it is not an event.
pub fn parse_webhook(root: &Value, bot_id: &str) -> Option<WebhookPayload> {
    if root.get("s").and_then(|s| s.as_i64()) != Some(0) {
        return None;
    }
    let d = root.get("d")?;
    let str_field = |key: &str| d.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();
    let verify_token = d
        .get("verify_token")
        .and_then(|v| v.as_str())
        .map(String::from);
    let ty = d.get("type").and_then(|t| t.as_i64()).unwrap_or(-1);
    let channel_type = str_field("channel_type");

    let kind = if ty == SYSTEM && channel_type == "WEBHOOK_CHALLENGE" {
        WebhookKind::Challenge(str_field("challenge"))
    } else if ty == TEXT || ty == i64::from(KMARKDOWN) {
        let extra = d.get("extra");
        let author_is_bot = extra
            .and_then(|e| e.get("author"))
            .and_then(|a| a.get("bot"))
            .and_then(|b| b.as_bool())
            .unwrap_or(false);
        let mentioned_user_ids = extra
            .and_then(|e| e.get("mention"))
            .and_then(|m| m.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| match id {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        WebhookKind::Message(InboundEvent {
            message_id: str_field("msg_id"),
            author_id: str_field("author_id"),
            author_is_bot,
            target_id: str_field("target_id"),
            is_direct: channel_type == "PERSON",
            text: strip_bot_mention(&str_field("content"), bot_id),
            mentioned_user_ids,
        })
    } else {
        WebhookKind::Other
    };
    Some(WebhookPayload { verify_token, kind })
}

/// State passed to the web server to handle the KOOK webhook.
#[derive(Clone)]
pub struct KookWebhookState {
    pub inbound_tx: mpsc::Sender<InboundEvent>,
    /// The bot's own user id; its mention markup is removed from message text.
    pub bot_id: String,
    /// When set, events must carry this verify token.
    pub verify_token: Option<String>,
}

/// Handle a KOOK webhook body. Returns (status_code, body_json_string).
/// Challenges are answered inline; messages are queued for the dispatcher and acknowledged
/// at once, so a slow completion never delays the HTTP response.
pub async fn handle_webhook_body(body: &str, state: &KookWebhookState) -> (u16, String) {
    let root: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(bytes = body.len(), "kook webhook body is not JSON (is compress=0 set?)");
            return (400, "{}".to_string());
        }
    };

    if root.get("encrypt").is_some() {
        tracing::warn!("kook webhook body is encrypted; clear the encrypt key in the developer console");
        return (200, "{}".to_string());
    }

    let Some(payload) = parse_webhook(&root, &state.bot_id) else {
        return (200, "{}".to_string());
    };

    if let Some(expected) = state.verify_token.as_deref() {
        if payload.verify_token.as_deref() != Some(expected) {
            tracing::warn!("kook webhook verify_token mismatch, rejected");
            return (403, "{}".to_string());
        }
    }

    match payload.kind {
        WebhookKind::Challenge(challenge) => {
            tracing::info!("kook webhook challenge answered");
            (200, serde_json::json!({ "challenge": challenge }).to_string())
        }
        WebhookKind::Message(event) => {
            let message_id = event.message_id.clone();
            if state.inbound_tx.try_send(event).is_err() {
                tracing::warn!(message_id = %message_id, "inbound queue full, message dropped");
            }
            (200, "{}".to_string())
        }
        WebhookKind::Other => (200, "{}".to_string()),
    }
}
