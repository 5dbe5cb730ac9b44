//! In-process [`PresenceBus`] used by tests and by single-instance
//! deployments running without a reachable bus.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use {async_trait::async_trait, tokio::sync::broadcast, tokio_stream::StreamExt};

use crate::{
    BusMessage, BusSubscription, PresenceBus,
    error::{BusError, BusResult},
};

const BROADCAST_BUFFER: usize = 1_024;

#[derive(Default)]
struct MemoryState {
    windows: HashMap<String, Vec<Instant>>,
    online: HashSet<String>,
    statuses: HashMap<String, String>,
    channel_members: HashMap<String, HashSet<String>>,
    user_channels: HashMap<String, HashSet<String>>,
}

pub struct MemoryPresenceBus {
    tx: broadcast::Sender<BusMessage>,
    state: Mutex<MemoryState>,
    /// When set, every operation fails with a connection-class error.
    /// Lets tests and demos exercise the outage path.
    failing: AtomicBool,
    /// When set, only publishes fail; commands keep working. Models a bus
    /// whose pub/sub link dropped while the command connection survives.
    failing_publishes: AtomicBool,
}

impl MemoryPresenceBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_BUFFER);
        Self {
            tx,
            state: Mutex::new(MemoryState::default()),
            failing: AtomicBool::new(false),
            failing_publishes: AtomicBool::new(false),
        }
    }

    /// Simulate a bus outage (or recovery).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Simulate a publish-only outage (or recovery).
    pub fn set_publish_failing(&self, failing: bool) {
        self.failing_publishes.store(failing, Ordering::SeqCst);
    }

    /// Users currently marked online.
    #[must_use]
    pub fn online_users(&self) -> HashSet<String> {
        self.lock().online.clone()
    }

    /// Recorded status string for a user, if any.
    #[must_use]
    pub fn user_status(&self, user_id: &str) -> Option<String> {
        self.lock().statuses.get(user_id).cloned()
    }

    /// Members recorded for a channel.
    #[must_use]
    pub fn channel_members(&self, channel_id: &str) -> HashSet<String> {
        self.lock()
            .channel_members
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self) -> BusResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::Connection("memory bus forced offline".into()));
        }
        Ok(())
    }
}

impl Default for MemoryPresenceBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Redis-style glob match: `*` matches any run of characters. The first
/// literal segment anchors at the start of the key, the last at the end.
fn glob_match(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let Some(mut rest) = key.strip_prefix(segments[0]) else {
        return false;
    };
    let last = segments[segments.len() - 1];
    for segment in &segments[1..segments.len() - 1] {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }
    last.is_empty() || rest.ends_with(last)
}

#[async_trait]
impl PresenceBus for MemoryPresenceBus {
    async fn publish(&self, key: &str, payload: &str) -> BusResult<()> {
        self.check()?;
        if self.failing_publishes.load(Ordering::SeqCst) {
            return Err(BusError::Connection("memory bus publish forced offline".into()));
        }
        // No subscribers is not an error, matching bus semantics.
        let _ = self.tx.send(BusMessage {
            key: key.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe_patterns(&self, patterns: &[&str]) -> BusResult<BusSubscription> {
        self.check()?;
        let patterns: Vec<String> = patterns.iter().map(|p| (*p).to_string()).collect();
        let rx = self.tx.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
            .filter_map(move |item| match item {
                Ok(msg) if patterns.iter().any(|p| glob_match(p, &msg.key)) => Some(msg),
                _ => None,
            });
        Ok(BusSubscription::new(Box::pin(stream)))
    }

    async fn sliding_window_count(&self, key: &str, window: Duration) -> BusResult<u64> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.lock();
        let entries = state.windows.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);
        let count = entries.len() as u64;
        entries.push(now);
        Ok(count)
    }

    async fn set_online(&self, user_id: &str) -> BusResult<()> {
        self.check()?;
        let mut state = self.lock();
        state.online.insert(user_id.to_string());
        state.statuses.insert(user_id.to_string(), "online".into());
        Ok(())
    }

    async fn set_offline(&self, user_id: &str) -> BusResult<()> {
        self.check()?;
        let mut state = self.lock();
        state.online.remove(user_id);
        state.statuses.insert(user_id.to_string(), "offline".into());
        Ok(())
    }

    async fn add_channel_member(&self, channel_id: &str, user_id: &str) -> BusResult<()> {
        self.check()?;
        let mut state = self.lock();
        state
            .channel_members
            .entry(channel_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        state
            .user_channels
            .entry(user_id.to_string())
            .or_default()
            .insert(channel_id.to_string());
        Ok(())
    }

    async fn remove_channel_member(&self, channel_id: &str, user_id: &str) -> BusResult<()> {
        self.check()?;
        let mut state = self.lock();
        if let Some(members) = state.channel_members.get_mut(channel_id) {
            members.remove(user_id);
            if members.is_empty() {
                state.channel_members.remove(channel_id);
            }
        }
        if let Some(channels) = state.user_channels.get_mut(user_id) {
            channels.remove(channel_id);
            if channels.is_empty() {
                state.user_channels.remove(user_id);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> BusResult<()> {
        self.check()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_delivery_patterns() {
        assert!(glob_match("chat:channel:*", "chat:channel:7"));
        assert!(glob_match("channel:*:events", "channel:7:events"));
        assert!(glob_match("user:*:notifications", "user:42:notifications"));
        assert!(!glob_match("chat:channel:*", "channel:7:events"));
        assert!(!glob_match("channel:*:events", "channel:7:members"));
        assert!(!glob_match("user:*:notifications", "user:42:status"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscription() {
        let bus = MemoryPresenceBus::new();
        let mut sub = bus
            .subscribe_patterns(&["chat:channel:*"])
            .await
            .unwrap();

        bus.publish("chat:channel:7", r#"{"id":"m1"}"#).await.unwrap();
        bus.publish("user:42:notifications", "ignored").await.unwrap();
        bus.publish("chat:channel:9", r#"{"id":"m2"}"#).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.key, "chat:channel:7");
        let second = sub.next().await.unwrap();
        assert_eq!(second.key, "chat:channel:9");
    }

    #[tokio::test]
    async fn sliding_window_counts_within_window() {
        let bus = MemoryPresenceBus::new();
        for expected in 0..5 {
            let count = bus
                .sliding_window_count("rate_limit:message:42:7", Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(count, expected);
        }
    }

    #[tokio::test]
    async fn forced_failure_is_connection_class() {
        let bus = MemoryPresenceBus::new();
        bus.set_failing(true);
        let err = bus.publish("chat:channel:7", "x").await.unwrap_err();
        assert!(err.is_connection());
        bus.set_failing(false);
        bus.publish("chat:channel:7", "x").await.unwrap();
    }

    #[tokio::test]
    async fn presence_sets_track_membership() {
        let bus = MemoryPresenceBus::new();
        bus.set_online("42").await.unwrap();
        bus.add_channel_member("7", "42").await.unwrap();
        assert!(bus.online_users().contains("42"));
        assert!(bus.channel_members("7").contains("42"));

        bus.remove_channel_member("7", "42").await.unwrap();
        bus.set_offline("42").await.unwrap();
        assert!(bus.channel_members("7").is_empty());
        assert_eq!(bus.user_status("42").as_deref(), Some("offline"));
    }
}
