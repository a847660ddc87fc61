//! IM (instant messaging) side of the bot.
//! Inbound events come from the platform adapter (channels::kook), go through the orchestrator,
//! which consults the command classifier and the session table and replies via the gateway.
//! The idle monitor runs beside it on the same session table.

pub mod channels;
pub mod command;
pub mod gateway;
pub mod log;
pub mod monitor;
pub mod orchestrator;
pub mod session;

pub use channels::kook;
pub use command::{classify, Command};
pub use gateway::{GatewayError, InboundEvent, MessagingGateway};
pub use monitor::{run_history_expiry_listener, IdleMonitor};
pub use orchestrator::{run_dispatcher, DropReason, Orchestrator, Outcome, ReplyPolicy};
pub use session::{BusyGuard, ChannelSession, SessionError, SessionTable};
