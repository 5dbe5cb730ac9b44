//! PresenceBus: the shared pub/sub + key-value store behind cross-instance
//! fan-out, presence, and rate limiting.
//!
//! The [`PresenceBus`] trait is the seam between the hub and the outside
//! world. [`RedisPresenceBus`] is the production implementation;
//! [`MemoryPresenceBus`] backs tests and the single-instance fallback mode.

mod error;
mod memory;
mod redis_bus;

use std::time::Duration;

use {async_trait::async_trait, futures::stream::BoxStream};

pub use {
    error::{BusError, BusResult},
    memory::MemoryPresenceBus,
    redis_bus::RedisPresenceBus,
};

/// Status hash TTL while a user is online.
pub const ONLINE_STATUS_TTL: Duration = Duration::from_secs(5 * 60);
/// Status hash TTL after a user goes offline.
pub const OFFLINE_STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ── Messages ─────────────────────────────────────────────────────────────────

/// One message delivered by a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The concrete key the message was published on.
    pub key: String,
    /// The serialized frame, exactly as published.
    pub payload: String,
}

/// A live pattern subscription. Dropping it tears the subscription down.
pub struct BusSubscription {
    messages: BoxStream<'static, BusMessage>,
}

impl BusSubscription {
    pub fn new(messages: BoxStream<'static, BusMessage>) -> Self {
        Self { messages }
    }

    /// Next message, or `None` when the underlying connection is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        use futures::StreamExt;
        self.messages.next().await
    }
}

// ── PresenceBus trait ────────────────────────────────────────────────────────

#[async_trait]
pub trait PresenceBus: Send + Sync {
    /// Publish a serialized frame on a delivery key.
    async fn publish(&self, key: &str, payload: &str) -> BusResult<()>;

    /// Open a fresh subscription covering the given glob patterns.
    async fn subscribe_patterns(&self, patterns: &[&str]) -> BusResult<BusSubscription>;

    /// Run the sliding-window batch for a rate-limit key: drop entries older
    /// than the window, count what remains, record this event, refresh the
    /// TTL. All four steps execute as one atomic batch. Returns the count
    /// *before* this event was recorded.
    async fn sliding_window_count(&self, key: &str, window: Duration) -> BusResult<u64>;

    /// Mark a user online: membership in `online_users` plus a status hash
    /// with a short TTL.
    async fn set_online(&self, user_id: &str) -> BusResult<()>;

    /// Mark a user offline; the status hash lingers with a long TTL.
    async fn set_offline(&self, user_id: &str) -> BusResult<()>;

    /// Record channel membership (`channel:{c}:members` / `user:{u}:channels`).
    async fn add_channel_member(&self, channel_id: &str, user_id: &str) -> BusResult<()>;

    /// Drop channel membership from both sets.
    async fn remove_channel_member(&self, channel_id: &str, user_id: &str) -> BusResult<()>;

    /// Liveness probe; used by the bridge to close its circuit.
    async fn ping(&self) -> BusResult<()>;
}
