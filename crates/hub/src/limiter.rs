//! Sliding-window rate limiting backed by the PresenceBus.

use std::sync::Arc;

use roost_config::RateLimitConfig;
use roost_presence::{BusResult, PresenceBus};
use roost_protocol::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited,
}

pub struct RateLimiter {
    bus: Arc<dyn PresenceBus>,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(bus: Arc<dyn PresenceBus>, config: RateLimitConfig) -> Self {
        Self { bus, config }
    }

    /// Per-(user, channel) message budget.
    pub async fn check_message(&self, user_id: &str, channel_id: &str) -> BusResult<RateDecision> {
        let key = keys::rate_limit_message(user_id, channel_id);
        let count = self
            .bus
            .sliding_window_count(&key, self.config.message_window())
            .await?;
        Ok(decide(count, self.config.message_limit))
    }

    /// Per-user websocket upgrade budget, checked by the gateway before the
    /// handshake completes.
    pub async fn check_socket(&self, user_id: &str) -> BusResult<RateDecision> {
        let key = keys::rate_limit_websocket(user_id);
        let count = self
            .bus
            .sliding_window_count(&key, self.config.socket_window())
            .await?;
        Ok(decide(count, self.config.socket_limit))
    }
}

fn decide(count: u64, limit: u64) -> RateDecision {
    if count < limit {
        RateDecision::Allowed
    } else {
        RateDecision::Limited
    }
}
