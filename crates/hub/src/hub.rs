//! The hub: single owner of the connection cache and the only task that
//! mutates it.
//!
//! All registrations, unregistrations, and decoded inbound frames flow
//! through one bounded inbox consumed by one event loop, so every cache
//! transition has a total order. Periodic cleanup and heartbeat ticks join
//! the same loop; the bridge's subscriber and health tasks run alongside
//! and only touch the cache through its locked API.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    metrics::{counter, gauge},
    tokio::{
        sync::{mpsc, watch},
        task::JoinHandle,
        time::{Instant, MissedTickBehavior, interval},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    roost_common::{Annotate, ConnectionKind, Observation, ObserverRegistry, SystemKind},
    roost_config::{CleanupConfig, RoostConfig},
    roost_presence::PresenceBus,
    roost_protocol::{Frame, Payload, keys, now_epoch_secs},
};

use crate::{
    bridge::Bridge,
    cache::ConnectionCache,
    error::HubError,
    limiter::{RateDecision, RateLimiter},
    session::Session,
    store::{MembershipOracle, MessageStore, NewChatMessage},
};

const INBOX_CAPACITY: usize = 1_024;
/// Reconnect storms are absorbed by delaying the offline presence write.
const OFFLINE_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug)]
pub enum HubEvent {
    Register {
        session: Arc<Session>,
        client_id: String,
    },
    Unregister {
        session_id: String,
        user_id: String,
    },
    Inbound {
        session: Arc<Session>,
        frame: Frame,
    },
    SetCleanupConfig(CleanupConfig),
}

/// Everything the hub needs, wired explicitly at startup.
pub struct HubContext {
    pub store: Arc<dyn MessageStore>,
    pub membership: Arc<dyn MembershipOracle>,
    pub bus: Arc<dyn PresenceBus>,
    pub observers: Arc<ObserverRegistry>,
    pub config: RoostConfig,
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Cloneable front door to the hub's inbox.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubEvent>,
    state: watch::Receiver<HubState>,
    shutdown: CancellationToken,
    handoff_wait: Duration,
}

impl HubHandle {
    /// Hand a new session to the hub. Returns false when the hub is gone.
    pub async fn register(&self, session: Arc<Session>, client_id: impl Into<String>) -> bool {
        self.tx
            .send(HubEvent::Register {
                session,
                client_id: client_id.into(),
            })
            .await
            .is_ok()
    }

    pub async fn unregister(&self, session: &Session) {
        let _ = self
            .tx
            .send(HubEvent::Unregister {
                session_id: session.session_id().to_string(),
                user_id: session.user_id().to_string(),
            })
            .await;
    }

    /// Bounded handoff from a read pump. On timeout the frame is dropped;
    /// the caller logs it.
    pub async fn inbound(&self, session: Arc<Session>, frame: Frame) -> Result<(), HubError> {
        self.tx
            .send_timeout(HubEvent::Inbound { session, frame }, self.handoff_wait)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    HubError::Timeout("hub inbox handoff timed out".into())
                },
                mpsc::error::SendTimeoutError::Closed(_) => HubError::SessionClosed,
            })
    }

    /// Restart the periodic cleanup/heartbeat tasks with new intervals.
    pub async fn set_cleanup_config(&self, config: CleanupConfig) {
        let _ = self.tx.send(HubEvent::SetCleanupConfig(config)).await;
    }

    #[must_use]
    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    /// Ask the hub to shut down. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolve once the hub has fully stopped.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        while *state.borrow() != HubState::Stopped {
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

// ── Hub ──────────────────────────────────────────────────────────────────────

pub struct Hub {
    cache: Arc<ConnectionCache>,
    bridge: Arc<Bridge>,
    limiter: RateLimiter,
    store: Arc<dyn MessageStore>,
    membership: Arc<dyn MembershipOracle>,
    bus: Arc<dyn PresenceBus>,
    observers: Arc<ObserverRegistry>,
    cleanup: CleanupConfig,
    shutdown_timeout: Duration,
    rx: Option<mpsc::Receiver<HubEvent>>,
    state_tx: watch::Sender<HubState>,
    shutdown: CancellationToken,
    /// Scheduled offline presence writes, keyed by user; aborted when the
    /// user reconnects inside the debounce window.
    pending_offline: HashMap<String, JoinHandle<()>>,
}

impl Hub {
    #[must_use]
    pub fn new(ctx: HubContext) -> (Self, HubHandle) {
        let cache = Arc::new(ConnectionCache::new());
        let bridge = Arc::new(Bridge::new(
            Arc::clone(&ctx.bus),
            Arc::clone(&cache),
            Arc::clone(&ctx.observers),
            ctx.config.bridge,
        ));
        let limiter = RateLimiter::new(Arc::clone(&ctx.bus), ctx.config.rate_limit);
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(HubState::Starting);
        let shutdown = CancellationToken::new();

        let handle = HubHandle {
            tx,
            state: state_rx,
            shutdown: shutdown.clone(),
            handoff_wait: ctx.config.session.hub_handoff_wait(),
        };
        let hub = Self {
            cache,
            bridge,
            limiter,
            store: ctx.store,
            membership: ctx.membership,
            bus: ctx.bus,
            observers: ctx.observers,
            cleanup: ctx.config.cleanup,
            shutdown_timeout: ctx.config.server.shutdown_timeout(),
            rx: Some(rx),
            state_tx,
            shutdown,
            pending_offline: HashMap::new(),
        };
        (hub, handle)
    }

    #[must_use]
    pub fn cache(&self) -> Arc<ConnectionCache> {
        Arc::clone(&self.cache)
    }

    #[must_use]
    pub fn bridge(&self) -> Arc<Bridge> {
        Arc::clone(&self.bridge)
    }

    // ── Event loop ───────────────────────────────────────────────────────

    pub async fn run(mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let _ = self.state_tx.send(HubState::Running);
        self.observers
            .emit(Observation::system(SystemKind::Started, "hub running"));
        info!("hub event loop started");

        let bridge_cancel = self.shutdown.child_token();
        let subscriber = tokio::spawn(
            Arc::clone(&self.bridge).run_subscriber(bridge_cancel.clone()),
        );
        let health = tokio::spawn(Arc::clone(&self.bridge).run_health(bridge_cancel.clone()));

        let shutdown = self.shutdown.clone();
        let mut cleanup_tick = new_interval(self.cleanup.cleanup_interval());
        let mut heartbeat_tick = new_interval(self.cleanup.heartbeat_interval());

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(HubEvent::SetCleanupConfig(config)) => {
                        info!(
                            cleanup_secs = config.cleanup_interval_secs,
                            heartbeat_secs = config.heartbeat_interval_secs,
                            "cleanup config updated, timers restarted"
                        );
                        self.cleanup = config;
                        cleanup_tick = new_interval(config.cleanup_interval());
                        heartbeat_tick = new_interval(config.heartbeat_interval());
                    },
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = cleanup_tick.tick() => self.evict_stale().await,
                _ = heartbeat_tick.tick() => self.send_heartbeats().await,
            }
        }

        self.shutdown_sequence(&mut rx, bridge_cancel).await;
        let _ = subscriber.await;
        let _ = health.await;
        let _ = self.state_tx.send(HubState::Stopped);
        info!("hub stopped");
    }

    async fn shutdown_sequence(
        &mut self,
        rx: &mut mpsc::Receiver<HubEvent>,
        bridge_cancel: CancellationToken,
    ) {
        let _ = self.state_tx.send(HubState::ShuttingDown);
        self.observers.emit(Observation::system(
            SystemKind::ShuttingDown,
            "hub shutting down",
        ));
        bridge_cancel.cancel();

        for session in self.cache.all_sessions().await {
            session.close();
        }

        // Let the gateway pumps report their unregisters so bookkeeping
        // settles, bounded by the global deadline.
        let deadline = Instant::now() + self.shutdown_timeout;
        while self.cache.connection_count().await > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let remaining_sessions = self.cache.connection_count().await;
                warn!(
                    remaining_sessions,
                    "shutdown deadline reached, dropping remaining sessions"
                );
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) | Err(_) => break,
            }
        }

        for handle in self.pending_offline.values() {
            handle.abort();
        }
        self.pending_offline.clear();
    }

    async fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register { session, client_id } => {
                self.handle_register(session, client_id).await;
            },
            HubEvent::Unregister {
                session_id,
                user_id,
            } => {
                self.unregister_session(&session_id, &user_id).await;
            },
            HubEvent::Inbound { session, frame } => {
                self.handle_inbound(session, frame).await;
            },
            HubEvent::SetCleanupConfig(config) => {
                // Reached only during shutdown drain; timers are gone.
                self.cleanup = config;
            },
        }
    }

    // ── Registration ─────────────────────────────────────────────────────

    async fn handle_register(&mut self, session: Arc<Session>, client_id: String) {
        let user_id = session.user_id().to_string();
        let session_id = session.session_id().to_string();

        // A reconnect inside the debounce window keeps the user online.
        if let Some(pending) = self.pending_offline.remove(&user_id) {
            pending.abort();
        }

        let replaced = self.cache.add_connection(Arc::clone(&session)).await;
        match replaced {
            Some(old) => {
                debug!(
                    user_id = %user_id,
                    old_session = old.session_id(),
                    new_session = %session_id,
                    "replacing existing session"
                );
                old.close();
                self.observers.emit(Observation::connection(
                    ConnectionKind::Replaced,
                    &user_id,
                    old.session_id(),
                ));
            },
            None => {
                // First local session for this user: mark presence online.
                if let Err(e) = self.bus.set_online(&user_id).await {
                    warn!(user_id = %user_id, error = %e, "presence online write failed");
                    self.observers
                        .emit(Observation::error("hub.presence", e.to_string()));
                }
            },
        }

        counter!("roost_connections_total").increment(1);
        gauge!("roost_active_connections").set(self.cache.connection_count().await as f64);
        self.observers.emit(Observation::connection(
            ConnectionKind::Connected,
            &user_id,
            &session_id,
        ));
        info!(user_id = %user_id, session_id = %session_id, "session registered");

        let ack = Frame::server(Payload::ConnectionConnect {
            client_id,
            status: "connected".into(),
        });
        match ack.encode() {
            Ok(json) => {
                if session.enqueue(json).is_err() {
                    self.unregister_session(&session_id, &user_id).await;
                }
            },
            Err(e) => warn!(error = %e, "failed to encode connect ack"),
        }
    }

    async fn unregister_session(&mut self, session_id: &str, user_id: &str) {
        let Some(current) = self.cache.user_session(user_id).await else {
            return;
        };
        if current.session_id() != session_id {
            // The session was already replaced; the replacement stays.
            return;
        }

        if let Some(session) = self.cache.remove_connection(user_id).await {
            session.close();
        }
        gauge!("roost_active_connections").set(self.cache.connection_count().await as f64);
        self.observers.emit(Observation::connection(
            ConnectionKind::Disconnected,
            user_id,
            session_id,
        ));
        info!(user_id, session_id, "session unregistered");

        // Last local session: schedule the offline write behind the
        // debounce so a quick reconnect cancels it.
        let bus = Arc::clone(&self.bus);
        let cache = Arc::clone(&self.cache);
        let observers = Arc::clone(&self.observers);
        let uid = user_id.to_string();
        let pending = tokio::spawn(async move {
            tokio::time::sleep(OFFLINE_DEBOUNCE).await;
            if cache.user_session(&uid).await.is_some() {
                return;
            }
            if let Err(e) = bus.set_offline(&uid).await {
                warn!(user_id = %uid, error = %e, "presence offline write failed");
                observers.emit(Observation::error("hub.presence", e.to_string()));
            }
        });
        if let Some(old) = self.pending_offline.insert(user_id.to_string(), pending) {
            old.abort();
        }
    }

    // ── Inbound frames ───────────────────────────────────────────────────

    async fn handle_inbound(&mut self, session: Arc<Session>, frame: Frame) {
        let user_id = session.user_id().to_string();
        self.cache.touch(&user_id).await;
        counter!("roost_frames_total").increment(1);
        self.observers
            .emit(Observation::metric("hub.frames", 1.0));

        let result = match frame.payload.clone() {
            Payload::ChannelJoin { channel_id } => {
                self.handle_join(&session, &frame, channel_id).await
            },
            Payload::ChannelLeave { channel_id } => {
                self.handle_leave(&session, &frame, channel_id).await
            },
            Payload::ChannelMessage { .. } => self.handle_message(&session, &frame).await,
            Payload::ChannelTyping { .. } | Payload::ChannelStopTyping { .. } => {
                self.handle_typing(&session, &frame).await
            },
            Payload::ConnectionPing {} => self.handle_ping(&session, &frame),
            other => Err(HubError::UnknownType(other.kind().into())),
        };

        if let Err(e) = result {
            self.report_error(&session, &frame, e);
        }
    }

    fn report_error(&self, session: &Session, frame: &Frame, error: HubError) {
        // Server-side faults feed the health view; client mistakes do not.
        let server_fault = matches!(
            error,
            HubError::PermissionCheck(_)
                | HubError::RateLimitCheck(_)
                | HubError::Store(_)
                | HubError::Bus(_)
                | HubError::Timeout(_)
                | HubError::Internal(_)
        );
        if server_fault {
            counter!("roost_hub_errors_total").increment(1);
            self.observers
                .emit(Observation::error("hub.inbound", error.to_string()));
        }

        match error.code() {
            Some(code) => {
                debug!(
                    user_id = session.user_id(),
                    frame_id = %frame.id,
                    code,
                    "rejecting frame"
                );
                let reply = Frame::error(frame.id.clone(), code, error.to_string());
                if let Ok(json) = reply.encode() {
                    let _ = session.enqueue(json);
                }
            },
            None => {
                warn!(
                    user_id = session.user_id(),
                    frame_id = %frame.id,
                    error = %error,
                    "failed to handle frame"
                );
            },
        }
    }

    async fn handle_join(
        &mut self,
        session: &Arc<Session>,
        frame: &Frame,
        channel_id: String,
    ) -> Result<(), HubError> {
        let user_id = session.user_id().to_string();
        match self
            .membership
            .can_user_join_channel(&user_id, &channel_id)
            .await
        {
            Ok(true) => {},
            Ok(false) => return Err(HubError::PermissionDenied { channel_id }),
            Err(e) => return Err(HubError::PermissionCheck(e.to_string())),
        }

        self.cache.add_user_to_channel(&user_id, &channel_id).await;
        if let Err(e) = self.bus.add_channel_member(&channel_id, &user_id).await {
            // Best-effort: local membership is authoritative for delivery.
            warn!(user_id = %user_id, channel_id = %channel_id, error = %e, "presence channel-member write failed");
        }
        debug!(user_id = %user_id, channel_id = %channel_id, "user joined channel");

        // Direct ack to the joiner, echoing the request id.
        let mut ack = Frame::server(Payload::ChannelMemberJoin {
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
        });
        ack.id = frame.id.clone();
        ack.user_id = Some(user_id.clone());
        let ack_json = ack.encode().annotate("encode join ack")?;
        let _ = session.enqueue(ack_json);

        // Everyone else hears about it through the bus; the envelope's
        // user_id keeps the joiner out of the event broadcast.
        let mut envelope = Frame::server(Payload::ChannelMemberJoin {
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
        });
        envelope.user_id = Some(user_id);
        let json = envelope.encode().annotate("encode member event")?;
        self.publish_or_deliver(&keys::channel_events(&channel_id), &json)
            .await;
        Ok(())
    }

    async fn handle_leave(
        &mut self,
        session: &Arc<Session>,
        frame: &Frame,
        channel_id: String,
    ) -> Result<(), HubError> {
        let user_id = session.user_id().to_string();
        self.cache
            .remove_user_from_channel(&user_id, &channel_id)
            .await;
        if let Err(e) = self.bus.remove_channel_member(&channel_id, &user_id).await {
            warn!(user_id = %user_id, channel_id = %channel_id, error = %e, "presence channel-member removal failed");
        }
        debug!(user_id = %user_id, channel_id = %channel_id, "user left channel");

        let mut ack = Frame::server(Payload::ChannelMemberLeave {
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
        });
        ack.id = frame.id.clone();
        ack.user_id = Some(user_id.clone());
        let ack_json = ack.encode().annotate("encode leave ack")?;
        let _ = session.enqueue(ack_json);

        let mut envelope = Frame::server(Payload::ChannelMemberLeave {
            channel_id: channel_id.clone(),
            user_id: user_id.clone(),
        });
        envelope.user_id = Some(user_id);
        let json = envelope.encode().annotate("encode member event")?;
        self.publish_or_deliver(&keys::channel_events(&channel_id), &json)
            .await;
        Ok(())
    }

    async fn handle_message(
        &mut self,
        session: &Arc<Session>,
        frame: &Frame,
    ) -> Result<(), HubError> {
        let Payload::ChannelMessage {
            channel_id,
            text,
            url,
            file_name,
            ..
        } = frame.payload.clone()
        else {
            return Err(HubError::InvalidFrame("not a channel.message".into()));
        };
        let user_id = session.user_id().to_string();

        if !self.cache.is_user_in_channel(&user_id, &channel_id).await {
            return Err(HubError::NotInChannel {
                user_id,
                channel_id,
            });
        }

        match self.limiter.check_message(&user_id, &channel_id).await {
            Ok(RateDecision::Allowed) => {},
            Ok(RateDecision::Limited) => return Err(HubError::RateLimited),
            Err(e) => return Err(HubError::RateLimitCheck(e.to_string())),
        }

        // Persist, then reload so the envelope carries the canonical row
        // and resolved sender profile.
        let created = self
            .store
            .create(NewChatMessage {
                channel_id: channel_id.clone(),
                sender_id: user_id.clone(),
                text,
                url,
                file_name,
                sent_at: frame.timestamp.unwrap_or_else(now_epoch_secs),
            })
            .await
            .map_err(|e| HubError::Store(e.to_string()))?;
        let row = match self.store.find_by_id(&created.id).await {
            Ok(Some(row)) => row,
            Ok(None) | Err(_) => {
                warn!(message_id = %created.id, "reload after persist failed, using created row");
                created
            },
        };

        let envelope = Frame {
            id: uuid::Uuid::new_v4().to_string(),
            payload: Payload::ChannelMessage {
                channel_id: row.channel_id.clone(),
                text: row.text,
                url: row.url,
                file_name: row.file_name,
                message_id: Some(row.id),
                sender_name: row.sender_name,
                sender_avatar: row.sender_avatar,
            },
            timestamp: Some(row.sent_at),
            user_id: Some(row.sender_id),
        };
        let json = envelope.encode().annotate("encode message envelope")?;

        counter!("roost_messages_total").increment(1);
        // Delivery, including to the sender, happens through the
        // subscriber, so every instance fans out identical bytes.
        if !self
            .publish_or_deliver(&keys::chat_channel(&channel_id), &json)
            .await
        {
            return Err(HubError::Bus(
                "cross-instance publish failed, delivered locally only".into(),
            ));
        }
        Ok(())
    }

    async fn handle_typing(
        &mut self,
        session: &Arc<Session>,
        frame: &Frame,
    ) -> Result<(), HubError> {
        let user_id = session.user_id().to_string();
        let Some(channel_id) = frame.payload.channel_id().map(str::to_string) else {
            return Err(HubError::InvalidFrame("typing frame without channel".into()));
        };
        if !self.cache.is_user_in_channel(&user_id, &channel_id).await {
            return Err(HubError::NotInChannel {
                user_id,
                channel_id,
            });
        }

        // Ephemeral: no persistence, no rate limit, and no error on a
        // failed publish since the local fallback still reaches this
        // instance.
        let mut envelope = Frame::server(frame.payload.clone());
        envelope.user_id = Some(user_id);
        let json = envelope.encode().annotate("encode typing event")?;
        self.publish_or_deliver(&keys::channel_events(&channel_id), &json)
            .await;
        Ok(())
    }

    fn handle_ping(&self, session: &Arc<Session>, frame: &Frame) -> Result<(), HubError> {
        let pong = Frame::server(Payload::ConnectionPong {
            ping_id: frame.id.clone(),
        });
        let json = pong.encode().annotate("encode pong")?;
        let _ = session.enqueue(json);
        Ok(())
    }

    /// Publish, falling back to direct local delivery while the bus is
    /// unavailable. Returns whether the cross-instance publish succeeded.
    async fn publish_or_deliver(&self, key: &str, payload: &str) -> bool {
        match self.bridge.publish(key, payload).await {
            Ok(()) => true,
            Err(_) => {
                self.bridge.deliver_local(key, payload).await;
                false
            },
        }
    }

    // ── Periodic maintenance ─────────────────────────────────────────────

    async fn evict_stale(&mut self) {
        self.pending_offline.retain(|_, handle| !handle.is_finished());

        for user_id in self
            .cache
            .stale_users(self.cleanup.inactivity_timeout())
            .await
        {
            let Some(session) = self.cache.user_session(&user_id).await else {
                continue;
            };
            info!(user_id = %user_id, session_id = session.session_id(), "evicting stale session");
            counter!("roost_stale_evictions_total").increment(1);
            self.observers.emit(Observation::connection(
                ConnectionKind::Stale,
                &user_id,
                session.session_id(),
            ));
            session.close();
            let session_id = session.session_id().to_string();
            self.unregister_session(&session_id, &user_id).await;
        }
    }

    async fn send_heartbeats(&mut self) {
        let frame = Frame::server(Payload::ConnectionPing {});
        let Ok(json) = frame.encode() else {
            return;
        };
        for session in self.cache.all_sessions().await {
            let user_id = session.user_id().to_string();
            let session_id = session.session_id().to_string();
            match session.enqueue(json.clone()) {
                Ok(()) => {
                    let unanswered = self.cache.record_heartbeat(&user_id).await;
                    if unanswered > u64::from(self.cleanup.max_heartbeat_failures) {
                        debug!(user_id = %user_id, unanswered, "heartbeat budget exhausted");
                        self.observers.emit(Observation::connection(
                            ConnectionKind::HeartbeatFailed,
                            &user_id,
                            &session_id,
                        ));
                        session.close();
                        self.unregister_session(&session_id, &user_id).await;
                    }
                },
                Err(_) => {
                    self.observers.emit(Observation::connection(
                        ConnectionKind::HeartbeatFailed,
                        &user_id,
                        &session_id,
                    ));
                    self.unregister_session(&session_id, &user_id).await;
                },
            }
        }
    }
}

fn new_interval(period: Duration) -> tokio::time::Interval {
    let mut tick = interval(period.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}
