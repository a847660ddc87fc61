//! Channel session table: one `ChannelSession` per configured channel, created at startup and
//! kept for the process lifetime. Only the busy flag, the one-to-one binding and the idle counter
//! change, and only through the methods here. Each mutation runs under the entry lock of its
//! channel; no lock is ever held across an await.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::ChannelConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("channel {0} is not configured")]
    UnknownChannel(String),

    #[error("channel {0} is not in one-to-one mode")]
    NotOneToOne(String),

    #[error("channel {channel_id} is already bound to {user_id}")]
    AlreadyBound { channel_id: String, user_id: String },
}

/// Snapshot of one channel's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSession {
    pub id: String,
    pub one_to_one: bool,
    pub max_service_secs: u64,
    pub max_reply_tokens: u32,
    pub enabled: bool,
    pub busy: bool,
    /// Only ever set on one-to-one channels.
    pub bound_user_id: Option<String>,
    pub bound_at: Option<DateTime<Utc>>,
    pub elapsed_idle_secs: u64,
}

impl ChannelSession {
    fn from_config(channel: &ChannelConfig) -> Self {
        Self {
            id: channel.id.trim().to_string(),
            one_to_one: channel.one_to_one,
            max_service_secs: channel.max_service_secs,
            max_reply_tokens: channel.max_reply_tokens,
            enabled: channel.enabled,
            busy: false,
            bound_user_id: None,
            bound_at: None,
            elapsed_idle_secs: 0,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound_user_id.is_some()
    }

    pub fn is_bound_to(&self, user_id: &str) -> bool {
        self.bound_user_id.as_deref() == Some(user_id)
    }
}

/// A binding the idle monitor found past its limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredBinding {
    pub channel_id: String,
    pub user_id: String,
    pub idle_secs: u64,
}

/// channel_id -> session. Injected into the orchestrator and the idle monitor.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<String, ChannelSession>,
}

impl SessionTable {
    pub fn from_config(channels: &[ChannelConfig]) -> Self {
        let sessions = DashMap::with_capacity(channels.len());
        for channel in channels {
            let session = ChannelSession::from_config(channel);
            sessions.insert(session.id.clone(), session);
        }
        Self { sessions }
    }

    /// `None` means the channel is not configured; callers drop the message silently.
    pub fn lookup(&self, channel_id: &str) -> Option<ChannelSession> {
        self.sessions.get(channel_id).map(|entry| entry.value().clone())
    }

    /// All sessions, ordered by channel id.
    pub fn snapshot(&self) -> Vec<ChannelSession> {
        let mut all: Vec<ChannelSession> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Set busy if it was clear. Returns false, without touching anything, when already busy
    /// or when the channel is unknown. Pair every `true` with exactly one `release`;
    /// prefer `acquire`, which does that on drop.
    pub fn try_acquire_busy(&self, channel_id: &str) -> bool {
        match self.sessions.get_mut(channel_id) {
            Some(mut session) if !session.busy => {
                session.busy = true;
                true
            }
            _ => false,
        }
    }

    pub fn release(&self, channel_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(channel_id) {
            session.busy = false;
        }
    }

    /// Scoped busy acquisition: the flag is cleared when the guard drops, on every exit path.
    pub fn acquire(&self, channel_id: &str) -> Option<BusyGuard<'_>> {
        if self.try_acquire_busy(channel_id) {
            Some(BusyGuard {
                table: self,
                channel_id: channel_id.to_string(),
            })
        } else {
            None
        }
    }

    /// Claim a one-to-one channel for `user_id` and restart its idle counter.
    pub fn bind(&self, channel_id: &str, user_id: &str) -> Result<(), SessionError> {
        let mut session = self
            .sessions
            .get_mut(channel_id)
            .ok_or_else(|| SessionError::UnknownChannel(channel_id.to_string()))?;
        if !session.one_to_one {
            return Err(SessionError::NotOneToOne(channel_id.to_string()));
        }
        if let Some(current) = &session.bound_user_id {
            return Err(SessionError::AlreadyBound {
                channel_id: channel_id.to_string(),
                user_id: current.clone(),
            });
        }
        session.bound_user_id = Some(user_id.to_string());
        session.bound_at = Some(Utc::now());
        session.elapsed_idle_secs = 0;
        Ok(())
    }

    /// Clear the binding. Idempotent; returns the user that was bound, if any.
    pub fn unbind(&self, channel_id: &str) -> Option<String> {
        let mut session = self.sessions.get_mut(channel_id)?;
        session.elapsed_idle_secs = 0;
        session.bound_at = None;
        session.bound_user_id.take()
    }

    /// Keep-alive: restart the idle counter without changing the binding.
    pub fn touch(&self, channel_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(channel_id) {
            session.elapsed_idle_secs = 0;
        }
    }

    /// One monitor tick. Every bound, idle, one-to-one session ages by `tick_secs`; those now
    /// strictly past `max_service_secs` are unbound under their entry lock and returned. Busy
    /// sessions are skipped for this tick. A limit of 0 never expires.
    pub fn age_idle(&self, tick_secs: u64) -> Vec<ExpiredBinding> {
        let mut expired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if !session.one_to_one || session.busy {
                continue;
            }
            let Some(user_id) = session.bound_user_id.clone() else {
                continue;
            };
            session.elapsed_idle_secs = session.elapsed_idle_secs.saturating_add(tick_secs);
            if session.max_service_secs > 0 && session.elapsed_idle_secs > session.max_service_secs {
                expired.push(ExpiredBinding {
                    channel_id: session.id.clone(),
                    user_id,
                    idle_secs: session.elapsed_idle_secs,
                });
                session.bound_user_id = None;
                session.bound_at = None;
                session.elapsed_idle_secs = 0;
            }
        }
        expired
    }
}

/// Holds a channel's busy flag; releases it on drop.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    table: &'a SessionTable,
    channel_id: String,
}

impl BusyGuard<'_> {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, one_to_one: bool, max_service_secs: u64) -> ChannelConfig {
        ChannelConfig {
            id: id.to_string(),
            one_to_one,
            max_service_secs,
            max_reply_tokens: 512,
            enabled: true,
        }
    }

    fn table() -> SessionTable {
        SessionTable::from_config(&[channel("shared", false, 0), channel("solo", true, 5)])
    }

    #[test]
    fn unknown_channel_is_not_found() {
        let t = table();
        assert!(t.lookup("elsewhere").is_none());
        assert!(!t.try_acquire_busy("elsewhere"));
        assert_eq!(
            t.bind("elsewhere", "u"),
            Err(SessionError::UnknownChannel("elsewhere".into()))
        );
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let t = table();
        assert!(t.try_acquire_busy("shared"));
        assert!(!t.try_acquire_busy("shared"));
        assert!(t.lookup("shared").unwrap().busy);
        t.release("shared");
        assert!(t.try_acquire_busy("shared"));
    }

    #[test]
    fn busy_channels_do_not_block_each_other() {
        let t = table();
        assert!(t.try_acquire_busy("shared"));
        assert!(t.try_acquire_busy("solo"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let t = table();
        {
            let guard = t.acquire("shared").expect("free channel");
            assert_eq!(guard.channel_id(), "shared");
            assert!(t.acquire("shared").is_none());
        }
        assert!(!t.lookup("shared").unwrap().busy);
    }

    #[test]
    fn guard_releases_on_early_return() {
        fn work(t: &SessionTable) -> Result<(), &'static str> {
            let _guard = t.acquire("shared").ok_or("busy")?;
            Err("backend failed")
        }
        let t = table();
        assert_eq!(work(&t), Err("backend failed"));
        assert!(!t.lookup("shared").unwrap().busy);
    }

    #[test]
    fn bind_then_unbind_round_trip() {
        let t = table();
        t.bind("solo", "U123").unwrap();
        let s = t.lookup("solo").unwrap();
        assert_eq!(s.bound_user_id.as_deref(), Some("U123"));
        assert!(s.bound_at.is_some());

        assert_eq!(t.unbind("solo").as_deref(), Some("U123"));
        let s = t.lookup("solo").unwrap();
        assert_eq!(s.bound_user_id, None);
        assert_eq!(s.bound_at, None);
    }

    #[test]
    fn unbind_is_idempotent() {
        let t = table();
        assert_eq!(t.unbind("solo"), None);
        assert_eq!(t.unbind("solo"), None);
        assert_eq!(t.unbind("shared"), None);
        assert!(!t.lookup("solo").unwrap().is_bound());
    }

    #[test]
    fn bind_requires_one_to_one_and_free_channel() {
        let t = table();
        assert_eq!(
            t.bind("shared", "U1"),
            Err(SessionError::NotOneToOne("shared".into()))
        );
        t.bind("solo", "U1").unwrap();
        assert_eq!(
            t.bind("solo", "U2"),
            Err(SessionError::AlreadyBound {
                channel_id: "solo".into(),
                user_id: "U1".into()
            })
        );
    }

    #[test]
    fn bind_and_touch_reset_the_idle_counter() {
        let t = table();
        t.bind("solo", "U1").unwrap();
        t.age_idle(1);
        t.age_idle(1);
        assert_eq!(t.lookup("solo").unwrap().elapsed_idle_secs, 2);
        t.touch("solo");
        assert_eq!(t.lookup("solo").unwrap().elapsed_idle_secs, 0);
        assert!(t.lookup("solo").unwrap().is_bound_to("U1"));
    }

    #[test]
    fn aging_survives_the_limit_and_expires_one_tick_past_it() {
        let t = table();
        t.bind("solo", "U1").unwrap();
        for _ in 0..5 {
            assert!(t.age_idle(1).is_empty());
        }
        let expired = t.age_idle(1);
        assert_eq!(
            expired,
            vec![ExpiredBinding {
                channel_id: "solo".into(),
                user_id: "U1".into(),
                idle_secs: 6
            }]
        );
    }

    #[test]
    fn busy_or_unbound_sessions_do_not_age() {
        let t = table();
        t.age_idle(1);
        assert_eq!(t.lookup("solo").unwrap().elapsed_idle_secs, 0);

        t.bind("solo", "U1").unwrap();
        assert!(t.try_acquire_busy("solo"));
        for _ in 0..10 {
            assert!(t.age_idle(1).is_empty());
        }
        assert_eq!(t.lookup("solo").unwrap().elapsed_idle_secs, 0);
    }

    #[test]
    fn zero_limit_never_expires() {
        let t = SessionTable::from_config(&[channel("solo", true, 0)]);
        t.bind("solo", "U1").unwrap();
        for _ in 0..100 {
            assert!(t.age_idle(1).is_empty());
        }
    }

    #[test]
    fn expiry_clears_the_binding_in_the_same_step() {
        let t = table();
        t.bind("solo", "U1").unwrap();
        for _ in 0..5 {
            t.age_idle(1);
        }
        assert_eq!(t.age_idle(1).len(), 1);
        let s = t.lookup("solo").unwrap();
        assert!(!s.is_bound());
        assert_eq!(s.bound_at, None);
        assert_eq!(s.elapsed_idle_secs, 0);

        t.bind("solo", "U2").unwrap();
        assert!(t.age_idle(1).is_empty());
        assert!(t.lookup("solo").unwrap().is_bound_to("U2"));
    }

    #[test]
    fn touch_before_the_expiring_tick_keeps_the_holder() {
        let t = table();
        t.bind("solo", "U1").unwrap();
        for _ in 0..5 {
            t.age_idle(1);
        }
        t.touch("solo");
        assert!(t.age_idle(1).is_empty());
        assert!(t.lookup("solo").unwrap().is_bound_to("U1"));
    }

    #[test]
    fn snapshot_is_sorted_by_id() {
        let ids: Vec<String> = table().snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["shared", "solo"]);
    }
}
