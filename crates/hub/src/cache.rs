//! In-process connection indexes: user → session, channel → joined users,
//! user → metadata, plus the targeted broadcast primitives.
//!
//! One read/write lock covers the three maps. The writer lock is held only
//! across memory updates; broadcasts snapshot their targets under the read
//! lock, release it, then enqueue. No I/O happens under the lock.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use {tokio::sync::RwLock, tracing::debug};

use crate::session::Session;

/// Per-user bookkeeping, mutated only through the cache API.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub user_id: String,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub channels: HashSet<String>,
    /// Heartbeats sent since the last inbound activity.
    pub heartbeats: u64,
}

impl ConnectionMetadata {
    fn new(user_id: String) -> Self {
        let now = Instant::now();
        Self {
            user_id,
            connected_at: now,
            last_activity: now,
            channels: HashSet::new(),
            heartbeats: 0,
        }
    }
}

/// Delivery tally for one targeted broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
struct CacheInner {
    user_sessions: HashMap<String, Arc<Session>>,
    channel_users: HashMap<String, HashSet<String>>,
    metadata: HashMap<String, ConnectionMetadata>,
}

#[derive(Default)]
pub struct ConnectionCache {
    inner: RwLock<CacheInner>,
}

impl ConnectionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Mutation ─────────────────────────────────────────────────────────

    /// Register a session, replacing any previous session for the same
    /// user. The replaced session is returned so the caller can tear it
    /// down; its channel memberships carry over to the new session.
    pub async fn add_connection(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let user_id = session.user_id().to_string();
        let mut inner = self.inner.write().await;
        let replaced = inner.user_sessions.insert(user_id.clone(), session);
        match inner.metadata.get_mut(&user_id) {
            Some(meta) if replaced.is_some() => {
                meta.connected_at = Instant::now();
                meta.last_activity = Instant::now();
                meta.heartbeats = 0;
            },
            _ => {
                inner
                    .metadata
                    .insert(user_id.clone(), ConnectionMetadata::new(user_id));
            },
        }
        replaced
    }

    /// Drop a user's session and every index entry pointing at it.
    pub async fn remove_connection(&self, user_id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let session = inner.user_sessions.remove(user_id)?;
        if let Some(meta) = inner.metadata.remove(user_id) {
            for channel in meta.channels {
                if let Some(users) = inner.channel_users.get_mut(&channel) {
                    users.remove(user_id);
                    if users.is_empty() {
                        inner.channel_users.remove(&channel);
                    }
                }
            }
        }
        debug!(user_id, session_id = session.session_id(), "connection removed");
        Some(session)
    }

    /// Returns true when the membership was newly added.
    pub async fn add_user_to_channel(&self, user_id: &str, channel_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.user_sessions.contains_key(user_id) {
            return false;
        }
        inner
            .channel_users
            .entry(channel_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        match inner.metadata.get_mut(user_id) {
            Some(meta) => {
                meta.last_activity = Instant::now();
                meta.channels.insert(channel_id.to_string())
            },
            None => false,
        }
    }

    /// Returns true when the membership existed.
    pub async fn remove_user_from_channel(&self, user_id: &str, channel_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = match inner.channel_users.get_mut(channel_id) {
            Some(users) => {
                let removed = users.remove(user_id);
                if users.is_empty() {
                    inner.channel_users.remove(channel_id);
                }
                removed
            },
            None => false,
        };
        if let Some(meta) = inner.metadata.get_mut(user_id) {
            meta.channels.remove(channel_id);
            meta.last_activity = Instant::now();
        }
        removed
    }

    /// Record inbound activity: resets the heartbeat run.
    pub async fn touch(&self, user_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(meta) = inner.metadata.get_mut(user_id) {
            meta.last_activity = Instant::now();
            meta.heartbeats = 0;
        }
    }

    /// Count one application heartbeat sent to the user. Returns the number
    /// of heartbeats since the last inbound activity.
    pub async fn record_heartbeat(&self, user_id: &str) -> u64 {
        let mut inner = self.inner.write().await;
        match inner.metadata.get_mut(user_id) {
            Some(meta) => {
                meta.heartbeats += 1;
                meta.heartbeats
            },
            None => 0,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn user_session(&self, user_id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.user_sessions.get(user_id).cloned()
    }

    pub async fn is_user_in_channel(&self, user_id: &str, channel_id: &str) -> bool {
        self.inner
            .read()
            .await
            .channel_users
            .get(channel_id)
            .is_some_and(|users| users.contains(user_id))
    }

    /// Joined users that still have a live session; dangling ids are
    /// filtered out.
    pub async fn online_users_in_channel(&self, channel_id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .channel_users
            .get(channel_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|u| inner.user_sessions.contains_key(*u))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn metadata(&self, user_id: &str) -> Option<ConnectionMetadata> {
        self.inner.read().await.metadata.get(user_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.user_sessions.len()
    }

    pub async fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .await
            .user_sessions
            .values()
            .cloned()
            .collect()
    }

    /// Users whose last activity is older than the timeout.
    pub async fn stale_users(&self, inactivity_timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .metadata
            .values()
            .filter(|meta| now.duration_since(meta.last_activity) > inactivity_timeout)
            .map(|meta| meta.user_id.clone())
            .collect()
    }

    // ── Targeted broadcast ───────────────────────────────────────────────

    pub async fn broadcast_to_channel(&self, channel_id: &str, frame: &str) -> BroadcastOutcome {
        let targets = self.channel_targets(channel_id, None).await;
        deliver(&targets, frame)
    }

    /// Broadcast to a channel, skipping one user's session (typically the
    /// sender of a typing or member event).
    pub async fn broadcast_to_channel_except(
        &self,
        channel_id: &str,
        except_user: &str,
        frame: &str,
    ) -> BroadcastOutcome {
        let targets = self.channel_targets(channel_id, Some(except_user)).await;
        deliver(&targets, frame)
    }

    pub async fn broadcast_to_user(&self, user_id: &str, frame: &str) -> BroadcastOutcome {
        let targets: Vec<Arc<Session>> =
            self.user_session(user_id).await.into_iter().collect();
        deliver(&targets, frame)
    }

    pub async fn broadcast_to_users(&self, user_ids: &[String], frame: &str) -> BroadcastOutcome {
        let targets = {
            let inner = self.inner.read().await;
            user_ids
                .iter()
                .filter_map(|u| inner.user_sessions.get(u).cloned())
                .collect::<Vec<_>>()
        };
        deliver(&targets, frame)
    }

    async fn channel_targets(
        &self,
        channel_id: &str,
        except_user: Option<&str>,
    ) -> Vec<Arc<Session>> {
        let inner = self.inner.read().await;
        inner
            .channel_users
            .get(channel_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|u| except_user != Some(u.as_str()))
                    .filter_map(|u| inner.user_sessions.get(u).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Enqueue outside any lock. A failed enqueue has already flipped the
/// session to closed; the caller's normal teardown path unregisters it.
fn deliver(targets: &[Arc<Session>], frame: &str) -> BroadcastOutcome {
    let mut outcome = BroadcastOutcome::default();
    for session in targets {
        match session.enqueue(frame.to_string()) {
            Ok(()) => outcome.delivered += 1,
            Err(_) => outcome.failed += 1,
        }
    }
    outcome
}
