//! Redis-backed [`PresenceBus`].
//!
//! Commands go through a [`ConnectionManager`] (auto-reconnecting
//! multiplexed connection). Pattern subscriptions each get a dedicated
//! pub/sub connection so the bridge can rebuild one independently after a
//! drop.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use {
    async_trait::async_trait,
    futures::StreamExt,
    redis::{AsyncCommands, aio::ConnectionManager},
    tracing::{debug, warn},
};

use roost_protocol::keys;

use crate::{
    BusMessage, BusSubscription, OFFLINE_STATUS_TTL, ONLINE_STATUS_TTL, PresenceBus,
    error::{BusError, BusResult},
};

pub struct RedisPresenceBus {
    client: redis::Client,
    manager: ConnectionManager,
    command_timeout: Duration,
}

impl RedisPresenceBus {
    /// Connect to the bus. Fails when the initial connection cannot be
    /// established; callers decide whether that is fatal (strict mode).
    pub async fn connect(url: &str, command_timeout: Duration) -> BusResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| BusError::Connection(format!("invalid bus url: {e}")))?;
        let manager = ConnectionManager::new(client.clone()).await?;
        debug!(url, "presence bus connected");
        Ok(Self {
            client,
            manager,
            command_timeout,
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> BusResult<T> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BusError::Connection("bus command timed out".into())),
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn epoch_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

#[async_trait]
impl PresenceBus for RedisPresenceBus {
    async fn publish(&self, key: &str, payload: &str) -> BusResult<()> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        let payload = payload.to_string();
        self.bounded(async move {
            let _: i64 = conn.publish(&key, &payload).await?;
            Ok(())
        })
        .await
    }

    async fn subscribe_patterns(&self, patterns: &[&str]) -> BusResult<BusSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(*pattern).await?;
        }
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let key = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { key, payload }),
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping undecodable bus payload");
                    None
                },
            }
        });
        Ok(BusSubscription::new(Box::pin(stream)))
    }

    async fn sliding_window_count(&self, key: &str, window: Duration) -> BusResult<u64> {
        let mut conn = self.manager.clone();
        let now = epoch_secs();
        let cutoff = now.saturating_sub(window.as_secs());
        let member = epoch_nanos().to_string();
        let key = key.to_string();
        let window_secs = window.as_secs() as i64;
        self.bounded(async move {
            // One MULTI/EXEC batch: trim, count, record, refresh TTL.
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .zrembyscore(&key, 0, cutoff as isize)
                .ignore()
                .zcard(&key)
                .zadd(&key, member, now as isize)
                .ignore()
                .expire(&key, window_secs)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(count)
        })
        .await
    }

    async fn set_online(&self, user_id: &str) -> BusResult<()> {
        let mut conn = self.manager.clone();
        let status_key = keys::user_status(user_id);
        let user_id = user_id.to_string();
        let now = epoch_secs();
        self.bounded(async move {
            let _: () = redis::pipe()
                .atomic()
                .sadd(keys::ONLINE_USERS, &user_id)
                .ignore()
                .hset_multiple(&status_key, &[
                    ("status", "online".to_string()),
                    ("last_seen", now.to_string()),
                    ("updated_at", now.to_string()),
                ])
                .ignore()
                .expire(&status_key, ONLINE_STATUS_TTL.as_secs() as i64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_offline(&self, user_id: &str) -> BusResult<()> {
        let mut conn = self.manager.clone();
        let status_key = keys::user_status(user_id);
        let user_id = user_id.to_string();
        let now = epoch_secs();
        self.bounded(async move {
            let _: () = redis::pipe()
                .atomic()
                .srem(keys::ONLINE_USERS, &user_id)
                .ignore()
                .hset_multiple(&status_key, &[
                    ("status", "offline".to_string()),
                    ("last_seen", now.to_string()),
                    ("updated_at", now.to_string()),
                ])
                .ignore()
                .expire(&status_key, OFFLINE_STATUS_TTL.as_secs() as i64)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn add_channel_member(&self, channel_id: &str, user_id: &str) -> BusResult<()> {
        let mut conn = self.manager.clone();
        let members_key = keys::channel_members(channel_id);
        let channels_key = keys::user_channels(user_id);
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();
        self.bounded(async move {
            let _: () = redis::pipe()
                .sadd(&members_key, &user_id)
                .ignore()
                .sadd(&channels_key, &channel_id)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn remove_channel_member(&self, channel_id: &str, user_id: &str) -> BusResult<()> {
        let mut conn = self.manager.clone();
        let members_key = keys::channel_members(channel_id);
        let channels_key = keys::user_channels(user_id);
        let channel_id = channel_id.to_string();
        let user_id = user_id.to_string();
        self.bounded(async move {
            let _: () = redis::pipe()
                .srem(&members_key, &user_id)
                .ignore()
                .srem(&channels_key, &channel_id)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> BusResult<()> {
        let mut conn = self.manager.clone();
        self.bounded(async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}
