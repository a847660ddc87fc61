//! Idle timeout monitor and backend history expiry listener.
//!
//! The monitor ticks once per second, ages every bound and idle one-to-one session, and ends
//! the ones past their limit: unbind (inside the table), drop backend history, notice in the channel.
//! The listener handles the other direction: the backend's own history timer fired, so the
//! binding (if any) goes too and the channel is told.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::completion::CompletionBackend;
use crate::im::gateway::MessagingGateway;
use crate::im::session::{ExpiredBinding, SessionTable};

pub const IDLE_TIMEOUT_NOTICE: &str = "连续对话已超时结束。继续聊天开启新的对话。";

/// Tick interval. Each tick adds one second of idle time.
pub const IDLE_TICK: Duration = Duration::from_secs(1);

pub struct IdleMonitor {
    sessions: Arc<SessionTable>,
    gateway: Arc<dyn MessagingGateway>,
    backend: Arc<dyn CompletionBackend>,
}

impl IdleMonitor {
    pub fn new(
        sessions: Arc<SessionTable>,
        gateway: Arc<dyn MessagingGateway>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            sessions,
            gateway,
            backend,
        }
    }

    /// Age all sessions by one tick and end those that expired. Returns what was ended.
    /// The table has already released each expired binding; the backend history goes next, and
    /// the notice is posted last so a slow send cannot hold up the release.
    pub async fn tick_once(&self) -> Vec<ExpiredBinding> {
        let expired = self.sessions.age_idle(IDLE_TICK.as_secs());
        for binding in &expired {
            tracing::info!(
                channel_id = %binding.channel_id,
                user_id = %binding.user_id,
                idle_secs = binding.idle_secs,
                "one-to-one session timed out"
            );
            self.backend.end_session(&binding.channel_id).await;
        }
        for binding in &expired {
            if let Err(e) = self
                .gateway
                .send_channel_message(&binding.channel_id, IDLE_TIMEOUT_NOTICE)
                .await
            {
                tracing::warn!(channel_id = %binding.channel_id, error = %e, "timeout notice failed");
            }
        }
        expired
    }

    /// Run forever, one tick per `IDLE_TICK`.
    pub async fn run(self) {
        let mut interval = tokio::time::interval_at(Instant::now() + IDLE_TICK, IDLE_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(tick_ms = IDLE_TICK.as_millis() as u64, "idle monitor started");
        loop {
            interval.tick().await;
            self.tick_once().await;
        }
    }
}

/// Consume channel ids whose backend history expired: clear the binding and post the notice.
/// Returns when the backend side of the channel is dropped.
pub async fn run_history_expiry_listener(
    mut expired_rx: mpsc::Receiver<String>,
    sessions: Arc<SessionTable>,
    gateway: Arc<dyn MessagingGateway>,
) {
    while let Some(channel_id) = expired_rx.recv().await {
        if sessions.lookup(&channel_id).is_none() {
            continue;
        }
        let previous = sessions.unbind(&channel_id);
        tracing::info!(
            channel_id = %channel_id,
            unbound_user_id = previous.as_deref().unwrap_or("-"),
            "conversation expired in backend"
        );
        if let Err(e) = gateway
            .send_channel_message(&channel_id, IDLE_TIMEOUT_NOTICE)
            .await
        {
            tracing::warn!(channel_id = %channel_id, error = %e, "timeout notice failed");
        }
    }
}
