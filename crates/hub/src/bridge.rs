//! Cross-instance fan-out: publishes outgoing envelopes on the PresenceBus
//! and routes subscribed envelopes into local broadcasts.
//!
//! Everything a client sees travels through the bus, so every instance,
//! the sender's included, delivers identical already-serialized bytes.
//! The circuit breaker isolates the hub from a failing bus: while open,
//! publishes fail fast and the hub falls back to direct local delivery.

use std::{sync::Arc, time::Duration};

use {
    metrics::counter,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    roost_common::{Observation, ObserverRegistry, SystemKind},
    roost_config::BridgeConfig,
    roost_presence::{BusError, BusResult, PresenceBus},
    roost_protocol::{Frame, Payload, keys, keys::RouteKey},
};

use crate::{cache::ConnectionCache, circuit::CircuitBreaker};

pub struct Bridge {
    bus: Arc<dyn PresenceBus>,
    cache: Arc<ConnectionCache>,
    observers: Arc<ObserverRegistry>,
    circuit: CircuitBreaker,
    config: BridgeConfig,
}

impl Bridge {
    #[must_use]
    pub fn new(
        bus: Arc<dyn PresenceBus>,
        cache: Arc<ConnectionCache>,
        observers: Arc<ObserverRegistry>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            bus,
            cache,
            observers,
            circuit: CircuitBreaker::new(
                config.circuit_error_threshold,
                config.circuit_open_timeout(),
            ),
            config,
        }
    }

    #[must_use]
    pub fn circuit_open(&self) -> bool {
        self.circuit.is_open()
    }

    // ── Publishing ───────────────────────────────────────────────────────

    /// Publish a serialized envelope. While the circuit is open this fails
    /// fast without touching the bus; callers keep the instance useful by
    /// delivering locally via [`deliver_local`](Self::deliver_local).
    pub async fn publish(&self, key: &str, payload: &str) -> BusResult<()> {
        if self.circuit.is_open() {
            counter!("roost_bus_publish_rejected_total").increment(1);
            self.observers.emit(Observation::system(
                SystemKind::Degraded,
                "bus circuit open, publish rejected",
            ));
            return Err(BusError::CircuitOpen);
        }

        match self.bus.publish(key, payload).await {
            Ok(()) => {
                if self.circuit.record_success() {
                    info!("bus publish succeeded, circuit closed");
                    self.observers
                        .emit(Observation::system(SystemKind::Recovered, "bus recovered"));
                }
                Ok(())
            },
            Err(e) => {
                counter!("roost_bus_publish_errors_total").increment(1);
                self.observers
                    .emit(Observation::error("bridge.publish", e.to_string()));
                if e.is_connection() && self.circuit.record_error() {
                    warn!(error = %e, "bus circuit opened");
                    self.observers.emit(Observation::system(
                        SystemKind::Degraded,
                        format!("bus circuit opened: {e}"),
                    ));
                }
                Err(e)
            },
        }
    }

    // ── Local delivery ───────────────────────────────────────────────────

    /// Route one envelope to the matching local broadcast. Used by the
    /// subscriber for every bus message and by the hub as the circuit-open
    /// fallback. Unparseable keys are logged and ignored.
    pub async fn deliver_local(&self, key: &str, payload: &str) {
        let Some(route) = RouteKey::parse(key) else {
            debug!(key, "ignoring unroutable bus key");
            return;
        };
        match route {
            RouteKey::ChatChannel(channel_id) => {
                let outcome = self.cache.broadcast_to_channel(&channel_id, payload).await;
                counter!("roost_frames_delivered_total")
                    .increment(outcome.delivered as u64);
            },
            RouteKey::ChannelEvents(channel_id) => {
                // Typing and member events skip the originating user: the
                // typist does not need an echo and the new member got a
                // direct ack from its own hub.
                let except = Frame::decode(payload.as_bytes())
                    .ok()
                    .filter(|f| {
                        matches!(
                            f.payload,
                            Payload::ChannelTyping { .. }
                                | Payload::ChannelStopTyping { .. }
                                | Payload::ChannelMemberJoin { .. }
                                | Payload::ChannelMemberLeave { .. }
                        )
                    })
                    .and_then(|f| f.user_id);
                let outcome = match except {
                    Some(user_id) => {
                        self.cache
                            .broadcast_to_channel_except(&channel_id, &user_id, payload)
                            .await
                    },
                    None => self.cache.broadcast_to_channel(&channel_id, payload).await,
                };
                counter!("roost_frames_delivered_total")
                    .increment(outcome.delivered as u64);
            },
            RouteKey::UserNotifications(user_id) => {
                self.cache.broadcast_to_user(&user_id, payload).await;
            },
        }
    }

    // ── Subscriber ───────────────────────────────────────────────────────

    /// Consume the bus subscription until cancelled, reconnecting with
    /// exponential backoff (base 5s, doubling, capped). After a full cycle
    /// of failed attempts the task sits out one circuit-open window before
    /// trying again.
    pub async fn run_subscriber(self: Arc<Self>, cancel: CancellationToken) {
        let mut delay = self.config.reconnect_base();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.bus.subscribe_patterns(keys::SUBSCRIBE_PATTERNS).await {
                Ok(mut subscription) => {
                    info!("bus subscription established");
                    delay = self.config.reconnect_base();
                    attempts = 0;
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            message = subscription.next() => match message {
                                Some(message) => {
                                    self.deliver_local(&message.key, &message.payload).await;
                                },
                                None => {
                                    warn!("bus subscription lost, reconnecting");
                                    break;
                                },
                            },
                        }
                    }
                },
                Err(e) => {
                    attempts += 1;
                    self.observers
                        .emit(Observation::error("bridge.subscribe", e.to_string()));
                    if attempts >= self.config.reconnect_attempts {
                        warn!(
                            attempts,
                            "bus unreachable, pausing subscriber for the circuit window"
                        );
                        self.observers.emit(Observation::system(
                            SystemKind::Degraded,
                            "bus subscriber exhausted reconnect attempts",
                        ));
                        attempts = 0;
                        delay = self.config.reconnect_base();
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            () = tokio::time::sleep(self.config.circuit_open_timeout()) => {},
                        }
                        continue;
                    }
                    debug!(attempt = attempts, delay_secs = delay.as_secs(), error = %e,
                        "bus subscribe failed, backing off");
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {},
                    }
                    delay = (delay * 2).min(self.config.reconnect_cap());
                },
            }
        }
    }

    // ── Health ───────────────────────────────────────────────────────────

    /// Periodic bus ping. A success while the circuit is open closes it and
    /// clears the consecutive-error counter.
    pub async fn run_health(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.health_ping_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = tick.tick() => {
                    match self.bus.ping().await {
                        Ok(()) => {
                            if self.circuit.record_success() {
                                info!("bus health ping succeeded, circuit closed");
                                self.observers.emit(Observation::system(
                                    SystemKind::Recovered,
                                    "bus health ping succeeded",
                                ));
                            }
                        },
                        Err(e) => {
                            debug!(error = %e, "bus health ping failed");
                            if e.is_connection() && self.circuit.record_error() {
                                self.observers.emit(Observation::system(
                                    SystemKind::Degraded,
                                    format!("bus circuit opened: {e}"),
                                ));
                            }
                        },
                    }
                },
            }
        }
    }

    #[cfg(test)]
    fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use roost_presence::MemoryPresenceBus;

    use super::*;
    use crate::session::Session;

    fn bridge_with(bus: Arc<MemoryPresenceBus>) -> (Arc<Bridge>, Arc<ConnectionCache>) {
        let cache = Arc::new(ConnectionCache::new());
        let observers = Arc::new(ObserverRegistry::new());
        let config = BridgeConfig {
            circuit_error_threshold: 3,
            circuit_open_timeout_secs: 30,
            ..BridgeConfig::default()
        };
        (
            Arc::new(Bridge::new(bus, Arc::clone(&cache), observers, config)),
            cache,
        )
    }

    #[tokio::test]
    async fn publish_failures_open_the_circuit() {
        let bus = Arc::new(MemoryPresenceBus::new());
        let (bridge, _cache) = bridge_with(Arc::clone(&bus));

        bus.set_failing(true);
        for _ in 0..3 {
            assert!(bridge.publish("chat:channel:7", "{}").await.is_err());
        }
        assert!(bridge.circuit_open());

        // Open circuit fails fast without touching the bus.
        let err = bridge.publish("chat:channel:7", "{}").await.unwrap_err();
        assert!(matches!(err, BusError::CircuitOpen));
    }

    #[tokio::test]
    async fn success_closes_the_circuit() {
        let bus = Arc::new(MemoryPresenceBus::new());
        let (bridge, _cache) = bridge_with(Arc::clone(&bus));

        bus.set_failing(true);
        for _ in 0..3 {
            let _ = bridge.publish("chat:channel:7", "{}").await;
        }
        assert!(bridge.circuit_open());

        bus.set_failing(false);
        bridge.circuit().record_success();
        assert!(!bridge.circuit_open());
        bridge.publish("chat:channel:7", "{}").await.unwrap();
    }

    #[tokio::test]
    async fn deliver_local_routes_chat_keys_to_channel() {
        let bus = Arc::new(MemoryPresenceBus::new());
        let (bridge, cache) = bridge_with(bus);

        let (session, mut pipes) = Session::new("42", 8);
        cache.add_connection(session).await;
        cache.add_user_to_channel("42", "7").await;

        bridge.deliver_local("chat:channel:7", r#"{"id":"m1"}"#).await;
        assert_eq!(pipes.outbound.recv().await.unwrap(), r#"{"id":"m1"}"#);
    }

    #[tokio::test]
    async fn deliver_local_excludes_typist() {
        let bus = Arc::new(MemoryPresenceBus::new());
        let (bridge, cache) = bridge_with(bus);

        let (typist, mut typist_pipes) = Session::new("1", 8);
        let (watcher, mut watcher_pipes) = Session::new("2", 8);
        cache.add_connection(typist).await;
        cache.add_connection(watcher).await;
        cache.add_user_to_channel("1", "7").await;
        cache.add_user_to_channel("2", "7").await;

        let typing = Frame {
            id: "t1".into(),
            payload: Payload::ChannelTyping {
                channel_id: "7".into(),
                is_typing: true,
            },
            timestamp: Some(1),
            user_id: Some("1".into()),
        };
        let json = typing.encode().unwrap();
        bridge.deliver_local("channel:7:events", &json).await;

        assert_eq!(watcher_pipes.outbound.recv().await.unwrap(), json);
        assert!(typist_pipes.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn deliver_local_ignores_unroutable_keys() {
        let bus = Arc::new(MemoryPresenceBus::new());
        let (bridge, _cache) = bridge_with(bus);
        // Must not panic or deliver anything.
        bridge.deliver_local("db:migration:status", "{}").await;
    }

    #[tokio::test]
    async fn subscriber_delivers_published_frames() {
        let bus = Arc::new(MemoryPresenceBus::new());
        let (bridge, cache) = bridge_with(Arc::clone(&bus));

        let (session, mut pipes) = Session::new("42", 8);
        cache.add_connection(session).await;
        cache.add_user_to_channel("42", "7").await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&bridge).run_subscriber(cancel.clone()));
        // Give the subscription a moment to establish.
        tokio::time::sleep(Duration::from_millis(20)).await;

        bridge.publish("chat:channel:7", r#"{"id":"m1"}"#).await.unwrap();

        let delivered =
            tokio::time::timeout(Duration::from_secs(1), pipes.outbound.recv()).await;
        assert_eq!(delivered.unwrap().unwrap(), r#"{"id":"m1"}"#);

        cancel.cancel();
        task.await.unwrap();
    }
}
