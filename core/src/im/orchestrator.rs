//! Conversation orchestrator: per inbound message, decide and act.
//!
//! Order: drop own/bot traffic → refuse direct messages → resolve the channel (unknown or
//! disabled: silent drop) → classify → one-to-one authorization (claim by mention, exclusivity)
//! → commands (help / end / persona) → chat through the busy gate to the completion backend.
//! Nothing here returns an error: backend and gateway failures are logged and end the turn
//! without a reply, and the busy flag is released on every path.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::completion::{CompletionBackend, Role};
use crate::im::command::{self, Command};
use crate::im::gateway::{InboundEvent, MessagingGateway};
use crate::im::log::truncate_content_default;
use crate::im::session::{ChannelSession, SessionTable};

pub const DIRECT_MESSAGE_NOTICE: &str = "（小声）对不起，我们工作时间不允许私聊的哦。";
pub const BUSY_NOTICE: &str = "YUI 正在思考中，请稍候……";
pub const WORKING_REACTION: &str = "⏳";
pub const DONE_REACTION: &str = "✅";

/// Behaviour switches taken from settings.
#[derive(Debug, Clone, Copy)]
pub struct ReplyPolicy {
    /// A persona command also restarts the one-to-one idle counter.
    pub persona_resets_idle: bool,
    /// Append "`token:IN,OUT`" to answers.
    pub show_token_usage: bool,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self {
            persona_resets_idle: false,
            show_token_usage: true,
        }
    }
}

/// How a message was handled. Returned for logging and tests; carries no obligation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Ignored without any reply (own traffic, unknown/disabled channel, not authorized, empty).
    Dropped(DropReason),
    DirectMessageRefused,
    Claimed,
    HelpShown,
    SessionEnded,
    PersonaSet,
    BusyRefused,
    Answered,
    /// Backend failed or returned nothing; no reply this turn.
    NoAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OwnOrBotAuthor,
    UnknownChannel,
    ChannelDisabled,
    NotClaimed,
    BoundToOtherUser,
    EmptyText,
}

pub struct Orchestrator {
    sessions: Arc<SessionTable>,
    gateway: Arc<dyn MessagingGateway>,
    backend: Arc<dyn CompletionBackend>,
    bot_id: String,
    policy: ReplyPolicy,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionTable>,
        gateway: Arc<dyn MessagingGateway>,
        backend: Arc<dyn CompletionBackend>,
        bot_id: impl Into<String>,
        policy: ReplyPolicy,
    ) -> Self {
        Self {
            sessions,
            gateway,
            backend,
            bot_id: bot_id.into(),
            policy,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Handle one inbound message to completion.
    pub async fn handle(&self, event: InboundEvent) -> Outcome {
        if event.author_is_bot || event.author_id == self.bot_id {
            return Outcome::Dropped(DropReason::OwnOrBotAuthor);
        }

        if event.is_direct || event.target_id == self.bot_id {
            tracing::info!(user_id = %event.author_id, direction = "incoming_dm", "direct message refused");
            if let Err(e) = self
                .gateway
                .send_direct_message(&event.author_id, DIRECT_MESSAGE_NOTICE)
                .await
            {
                tracing::warn!(user_id = %event.author_id, error = %e, "direct message notice failed");
            }
            return Outcome::DirectMessageRefused;
        }

        let channel_id = event.target_id.as_str();
        let Some(session) = self.sessions.lookup(channel_id) else {
            tracing::debug!(channel_id = %channel_id, "message for unconfigured channel dropped");
            return Outcome::Dropped(DropReason::UnknownChannel);
        };
        if !session.enabled {
            tracing::debug!(channel_id = %channel_id, "message for disabled channel dropped");
            return Outcome::Dropped(DropReason::ChannelDisabled);
        }

        tracing::info!(
            channel_id = %channel_id,
            user_id = %event.author_id,
            message_id = %event.message_id,
            direction = "incoming",
            content = %truncate_content_default(&event.text),
        );

        let command = command::classify(&event.text);

        if session.one_to_one {
            if let Some(outcome) = self.authorize_one_to_one(&session, &event, &command).await {
                return outcome;
            }
        }

        match command {
            Command::Help => {
                let text = help_text(&session);
                self.reply(channel_id, &text).await;
                Outcome::HelpShown
            }
            Command::EndSession => {
                let text = self.backend.end_session(channel_id).await;
                self.sessions.unbind(channel_id);
                tracing::info!(channel_id = %channel_id, user_id = %event.author_id, "session ended");
                self.reply(channel_id, &text).await;
                Outcome::SessionEnded
            }
            Command::SetPersona(body) => {
                let text = self.backend.set_persona(channel_id, &body).await;
                if self.policy.persona_resets_idle {
                    self.sessions.touch(channel_id);
                }
                self.reply(channel_id, &text).await;
                Outcome::PersonaSet
            }
            Command::PlainChat(text) => {
                if text.is_empty() {
                    return Outcome::Dropped(DropReason::EmptyText);
                }
                self.chat(&session, &event, &text).await
            }
        }
    }

    /// One-to-one gate. `None` means the author holds the binding and handling continues.
    async fn authorize_one_to_one(
        &self,
        session: &ChannelSession,
        event: &InboundEvent,
        command: &Command,
    ) -> Option<Outcome> {
        let channel_id = session.id.as_str();
        match session.bound_user_id.as_deref() {
            None if event.mentions(&self.bot_id) => match self.sessions.bind(channel_id, &event.author_id) {
                Ok(()) => {
                    tracing::info!(channel_id = %channel_id, user_id = %event.author_id, "one-to-one session claimed");
                    let text = format!(
                        "{}\n\n{}",
                        claim_confirmation(&event.author_id, session.max_service_secs),
                        help_text(session)
                    );
                    self.reply(channel_id, &text).await;
                    Some(Outcome::Claimed)
                }
                Err(e) => {
                    // someone else claimed it between lookup and bind
                    tracing::debug!(channel_id = %channel_id, user_id = %event.author_id, error = %e, "claim lost");
                    Some(Outcome::Dropped(DropReason::BoundToOtherUser))
                }
            },
            None if *command == Command::Help => {
                let text = help_text(session);
                self.reply(channel_id, &text).await;
                Some(Outcome::HelpShown)
            }
            None => {
                tracing::debug!(channel_id = %channel_id, user_id = %event.author_id, "unclaimed one-to-one channel, dropped");
                Some(Outcome::Dropped(DropReason::NotClaimed))
            }
            Some(holder) if holder != event.author_id => {
                tracing::debug!(channel_id = %channel_id, user_id = %event.author_id, holder = %holder, "not the session holder, dropped");
                Some(Outcome::Dropped(DropReason::BoundToOtherUser))
            }
            Some(_) => None,
        }
    }

    async fn chat(&self, session: &ChannelSession, event: &InboundEvent, text: &str) -> Outcome {
        let channel_id = session.id.as_str();
        let Some(_busy) = self.sessions.acquire(channel_id) else {
            tracing::info!(channel_id = %channel_id, user_id = %event.author_id, "channel busy, message refused");
            self.reply(channel_id, BUSY_NOTICE).await;
            return Outcome::BusyRefused;
        };

        self.react(&event.message_id, WORKING_REACTION).await;
        self.sessions.touch(channel_id);

        let result = self
            .backend
            .converse(channel_id, Role::User, text, session.max_reply_tokens)
            .await;
        // the call itself counts as activity
        self.sessions.touch(channel_id);

        match result {
            Ok(completion) if !completion.text.trim().is_empty() => {
                let mut answer = completion.text;
                if self.policy.show_token_usage {
                    answer.push_str(&format!(
                        "\n`token:{},{}`",
                        completion.usage.prompt_tokens, completion.usage.completion_tokens
                    ));
                }
                self.reply(channel_id, &answer).await;
                self.unreact(&event.message_id, WORKING_REACTION).await;
                self.react(&event.message_id, DONE_REACTION).await;
                Outcome::Answered
            }
            Ok(_) => {
                tracing::warn!(channel_id = %channel_id, "backend returned an empty answer");
                Outcome::NoAnswer
            }
            Err(e) => {
                tracing::error!(channel_id = %channel_id, error = %e, "completion failed");
                Outcome::NoAnswer
            }
        }
    }

    async fn reply(&self, channel_id: &str, text: &str) {
        match self.gateway.send_channel_message(channel_id, text).await {
            Ok(message_id) => tracing::debug!(
                channel_id = %channel_id,
                message_id = %message_id,
                direction = "outgoing",
                content = %truncate_content_default(text),
            ),
            Err(e) => tracing::warn!(
                channel_id = %channel_id,
                direction = "outgoing",
                content = %truncate_content_default(text),
                error = %e,
                "send failed"
            ),
        }
    }

    async fn react(&self, message_id: &str, emoji: &str) {
        if let Err(e) = self.gateway.add_reaction(message_id, emoji).await {
            tracing::debug!(message_id = %message_id, emoji = %emoji, error = %e, "add reaction failed");
        }
    }

    async fn unreact(&self, message_id: &str, emoji: &str) {
        if let Err(e) = self.gateway.remove_reaction(message_id, emoji, &self.bot_id).await {
            tracing::debug!(message_id = %message_id, emoji = %emoji, error = %e, "remove reaction failed");
        }
    }
}

/// Take events off the inbound queue and handle each on its own task, so a slow completion in
/// one channel never holds up another. Returns when every sender is gone.
pub async fn run_dispatcher(mut inbound_rx: mpsc::Receiver<InboundEvent>, orchestrator: Arc<Orchestrator>) {
    while let Some(event) = inbound_rx.recv().await {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let channel_id = event.target_id.clone();
            let outcome = orchestrator.handle(event).await;
            tracing::debug!(channel_id = %channel_id, outcome = ?outcome, "message handled");
        });
    }
}

/// KMarkdown mention of a user.
pub fn mention(user_id: &str) -> String {
    format!("(met){}(met)", user_id)
}

fn claim_confirmation(user_id: &str, max_service_secs: u64) -> String {
    if max_service_secs > 0 {
        format!(
            "已为 {} 开启一对一对话。闲置超过 {} 秒会自动结束。",
            mention(user_id),
            max_service_secs
        )
    } else {
        format!("已为 {} 开启一对一对话。", mention(user_id))
    }
}

/// Help for the channel as it is right now.
pub fn help_text(session: &ChannelSession) -> String {
    let mut lines = vec![
        "**YUI 使用说明**".to_string(),
        "· 直接发送消息即可与 YUI 聊天".to_string(),
        "· `调教 <人设>`：设定 YUI 的人设，`调教` 后留空则清除".to_string(),
        "· `重置对话`：清空上下文，开始新的对话".to_string(),
        "· `帮助`：显示本说明".to_string(),
    ];
    if session.one_to_one {
        lines.push("本频道为一对一模式：@YUI 即可开启对话，期间只回复开启者。".to_string());
        if session.max_service_secs > 0 {
            lines.push(format!("闲置超过 {} 秒后对话自动结束。", session.max_service_secs));
        }
        if let Some(holder) = &session.bound_user_id {
            lines.push(format!("当前对话者：{}", mention(holder)));
        }
    }
    lines.join("\n")
}
