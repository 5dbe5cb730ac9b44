//! End-to-end hub flows over the in-process bus: register, join, send,
//! rate limits, replacement, eviction, and bus outage behavior.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio::{sync::mpsc, task::JoinHandle, time::timeout},
};

use {
    roost_common::ObserverRegistry,
    roost_config::RoostConfig,
    roost_hub::{
        Hub, HubContext, HubHandle, MembershipOracle, MemoryMessageStore, MessageStore, Session,
        SessionPipes,
    },
    roost_presence::MemoryPresenceBus,
    roost_protocol::{Frame, Payload, error_codes, now_epoch_secs},
};

// ── Harness ──────────────────────────────────────────────────────────────────

struct ScriptedMembership {
    denied: HashSet<(String, String)>,
    failing_channels: HashSet<String>,
}

impl ScriptedMembership {
    fn allow_all() -> Self {
        Self {
            denied: HashSet::new(),
            failing_channels: HashSet::new(),
        }
    }

    fn deny(mut self, user_id: &str, channel_id: &str) -> Self {
        self.denied
            .insert((user_id.to_string(), channel_id.to_string()));
        self
    }

    fn fail_on(mut self, channel_id: &str) -> Self {
        self.failing_channels.insert(channel_id.to_string());
        self
    }
}

#[async_trait]
impl MembershipOracle for ScriptedMembership {
    async fn can_user_join_channel(
        &self,
        user_id: &str,
        channel_id: &str,
    ) -> anyhow::Result<bool> {
        if self.failing_channels.contains(channel_id) {
            anyhow::bail!("membership backend unavailable");
        }
        Ok(!self
            .denied
            .contains(&(user_id.to_string(), channel_id.to_string())))
    }
}

struct Harness {
    handle: HubHandle,
    bus: Arc<MemoryPresenceBus>,
    store: Arc<MemoryMessageStore>,
    hub_task: JoinHandle<()>,
}

impl Harness {
    fn spawn_with(config: RoostConfig, membership: ScriptedMembership) -> Self {
        let bus = Arc::new(MemoryPresenceBus::new());
        let store = Arc::new(MemoryMessageStore::new());
        let (hub, handle) = Hub::new(HubContext {
            store: Arc::clone(&store) as Arc<dyn MessageStore>,
            membership: Arc::new(membership),
            bus: Arc::clone(&bus) as Arc<dyn roost_presence::PresenceBus>,
            observers: Arc::new(ObserverRegistry::new()),
            config,
        });
        let hub_task = tokio::spawn(hub.run());
        Self {
            handle,
            bus,
            store,
            hub_task,
        }
    }

    fn spawn() -> Self {
        Self::spawn_with(RoostConfig::default(), ScriptedMembership::allow_all())
    }

    /// Register a session and consume the `connection.connect` ack.
    async fn connect(&self, user_id: &str) -> (Arc<Session>, SessionPipes) {
        let (session, mut pipes) = Session::new(user_id, 64);
        assert!(
            self.handle
                .register(Arc::clone(&session), session.session_id().to_string())
                .await
        );
        let ack = recv_frame(&mut pipes.outbound).await;
        assert!(matches!(ack.payload, Payload::ConnectionConnect { .. }));
        (session, pipes)
    }

    /// Send a client frame the way the read pump would: stamped with the
    /// session identity and a server timestamp.
    async fn send(&self, session: &Arc<Session>, raw: &str) {
        let mut frame = Frame::decode(raw.as_bytes()).unwrap();
        frame.user_id = Some(session.user_id().to_string());
        frame.timestamp = Some(now_epoch_secs());
        self.handle
            .inbound(Arc::clone(session), frame)
            .await
            .unwrap();
    }

    async fn shutdown(self) {
        self.handle.shutdown();
        let _ = timeout(Duration::from_secs(5), self.hub_task).await;
    }
}

/// Receive the next non-heartbeat frame.
async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> Frame {
    loop {
        let raw = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound closed");
        let frame = Frame::decode(raw.as_bytes()).unwrap();
        if matches!(frame.payload, Payload::ConnectionPing {}) {
            continue;
        }
        return frame;
    }
}

async fn join(harness: &Harness, session: &Arc<Session>, pipes: &mut SessionPipes, channel: &str) {
    harness
        .send(
            session,
            &format!(r#"{{"id":"join-{channel}","type":"channel.join","data":{{"channel_id":"{channel}"}}}}"#),
        )
        .await;
    let ack = recv_frame(&mut pipes.outbound).await;
    assert!(
        matches!(ack.payload, Payload::ChannelMemberJoin { .. }),
        "expected join ack, got {:?}",
        ack.payload
    );
    assert_eq!(ack.id, format!("join-{channel}"));
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_send_persists_then_fans_out() {
    let harness = Harness::spawn();
    harness.store.set_profile("42", "ada", Some("ada.png"));

    let (sender, mut sender_pipes) = harness.connect("42").await;
    let (receiver, mut receiver_pipes) = harness.connect("43").await;
    join(&harness, &sender, &mut sender_pipes, "7").await;
    join(&harness, &receiver, &mut receiver_pipes, "7").await;
    // The receiver's join was fanned out to the sender; drain it.
    let fanout = recv_frame(&mut sender_pipes.outbound).await;
    assert!(matches!(fanout.payload, Payload::ChannelMemberJoin { .. }));

    harness
        .send(
            &sender,
            r#"{"id":"m2","type":"channel.message","data":{"channel_id":"7","text":"hi"}}"#,
        )
        .await;

    // Both members receive the envelope through the pub/sub loop, the
    // sender included.
    for pipes in [&mut sender_pipes, &mut receiver_pipes] {
        let envelope = recv_frame(&mut pipes.outbound).await;
        match envelope.payload {
            Payload::ChannelMessage {
                channel_id,
                text,
                message_id,
                sender_name,
                sender_avatar,
                ..
            } => {
                assert_eq!(channel_id, "7");
                assert_eq!(text.as_deref(), Some("hi"));
                assert_eq!(sender_name.as_deref(), Some("ada"));
                assert_eq!(sender_avatar.as_deref(), Some("ada.png"));
                // Persistence happens before the broadcast: the envelope
                // references a row that must exist.
                let id = message_id.expect("envelope missing message id");
                assert!(harness.store.find_by_id(&id).await.unwrap().is_some());
            },
            other => panic!("expected channel.message, got {other:?}"),
        }
        assert_eq!(envelope.user_id.as_deref(), Some("42"));
    }
    assert_eq!(harness.store.len(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn message_without_join_is_rejected_and_not_persisted() {
    let harness = Harness::spawn();
    let (session, mut pipes) = harness.connect("42").await;

    harness
        .send(
            &session,
            r#"{"id":"m1","type":"channel.message","data":{"channel_id":"9","text":"hi"}}"#,
        )
        .await;

    let reply = recv_frame(&mut pipes.outbound).await;
    assert_eq!(reply.id, "m1");
    match reply.payload {
        Payload::Error { code, .. } => assert_eq!(code, error_codes::NOT_IN_CHANNEL),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert!(harness.store.is_empty());
    assert!(!session.is_closed());

    harness.shutdown().await;
}

#[tokio::test]
async fn eleventh_message_in_window_is_rate_limited() {
    let mut config = RoostConfig::default();
    config.rate_limit.message_limit = 10;
    let harness = Harness::spawn_with(config, ScriptedMembership::allow_all());

    let (session, mut pipes) = harness.connect("42").await;
    join(&harness, &session, &mut pipes, "7").await;

    for n in 0..11 {
        harness
            .send(
                &session,
                &format!(
                    r#"{{"id":"m{n}","type":"channel.message","data":{{"channel_id":"7","text":"hello {n}"}}}}"#
                ),
            )
            .await;
    }

    let mut delivered = 0;
    let mut limited = 0;
    for _ in 0..11 {
        let frame = recv_frame(&mut pipes.outbound).await;
        match frame.payload {
            Payload::ChannelMessage { .. } => delivered += 1,
            Payload::Error { code, .. } => {
                assert_eq!(code, error_codes::RATE_LIMITED);
                limited += 1;
            },
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(delivered, 10);
    assert_eq!(limited, 1);
    assert_eq!(harness.store.len(), 10);
    // The session survives being limited.
    assert!(!session.is_closed());

    harness.shutdown().await;
}

#[tokio::test]
async fn duplicate_registration_replaces_previous_session() {
    let harness = Harness::spawn();

    let (first, _first_pipes) = harness.connect("42").await;
    let (second, mut second_pipes) = harness.connect("42").await;

    assert!(first.is_closed());
    assert!(!second.is_closed());

    // The replacement session is fully functional.
    join(&harness, &second, &mut second_pipes, "7").await;

    harness.shutdown().await;
}

#[tokio::test]
async fn permission_denied_and_permission_error() {
    let membership = ScriptedMembership::allow_all()
        .deny("42", "7")
        .fail_on("13");
    let harness = Harness::spawn_with(RoostConfig::default(), membership);
    let (session, mut pipes) = harness.connect("42").await;

    harness
        .send(
            &session,
            r#"{"id":"j1","type":"channel.join","data":{"channel_id":"7"}}"#,
        )
        .await;
    let reply = recv_frame(&mut pipes.outbound).await;
    match reply.payload {
        Payload::Error { code, .. } => assert_eq!(code, error_codes::PERMISSION_DENIED),
        other => panic!("expected error, got {other:?}"),
    }

    harness
        .send(
            &session,
            r#"{"id":"j2","type":"channel.join","data":{"channel_id":"13"}}"#,
        )
        .await;
    let reply = recv_frame(&mut pipes.outbound).await;
    match reply.payload {
        Payload::Error { code, .. } => assert_eq!(code, error_codes::PERMISSION_ERROR),
        other => panic!("expected error, got {other:?}"),
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn server_only_types_are_rejected_as_unknown() {
    let harness = Harness::spawn();
    let (session, mut pipes) = harness.connect("42").await;

    harness
        .send(
            &session,
            r#"{"id":"s1","type":"user.status","data":{"status":"online","last_seen":1}}"#,
        )
        .await;
    let reply = recv_frame(&mut pipes.outbound).await;
    match reply.payload {
        Payload::Error { code, .. } => assert_eq!(code, error_codes::UNKNOWN_MESSAGE_TYPE),
        other => panic!("expected error, got {other:?}"),
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn ping_answers_with_pong_referencing_ping_id() {
    let harness = Harness::spawn();
    let (session, mut pipes) = harness.connect("42").await;

    harness
        .send(&session, r#"{"id":"p1","type":"connection.ping","data":{}}"#)
        .await;
    let reply = recv_frame(&mut pipes.outbound).await;
    match reply.payload {
        Payload::ConnectionPong { ping_id } => assert_eq!(ping_id, "p1"),
        other => panic!("expected pong, got {other:?}"),
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn typing_reaches_channel_but_not_the_typist() {
    let harness = Harness::spawn();
    let (typist, mut typist_pipes) = harness.connect("1").await;
    let (watcher, mut watcher_pipes) = harness.connect("2").await;
    join(&harness, &typist, &mut typist_pipes, "7").await;
    join(&harness, &watcher, &mut watcher_pipes, "7").await;
    // Drain the watcher's join fan-out from the typist's queue.
    let _ = recv_frame(&mut typist_pipes.outbound).await;

    harness
        .send(
            &typist,
            r#"{"id":"t1","type":"channel.typing","data":{"channel_id":"7","is_typing":true}}"#,
        )
        .await;

    let seen = recv_frame(&mut watcher_pipes.outbound).await;
    match seen.payload {
        Payload::ChannelTyping {
            channel_id,
            is_typing,
        } => {
            assert_eq!(channel_id, "7");
            assert!(is_typing);
        },
        other => panic!("expected typing event, got {other:?}"),
    }
    // Nothing persisted, nothing echoed to the typist.
    assert!(harness.store.is_empty());
    assert!(typist_pipes.outbound.try_recv().is_err());

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stale_session_is_evicted_and_goes_offline_after_debounce() {
    let mut config = RoostConfig::default();
    // Any silence at all counts as stale; the paused clock drives the
    // cleanup tick immediately.
    config.cleanup.inactivity_timeout_secs = 0;
    config.cleanup.cleanup_interval_secs = 1;
    let harness = Harness::spawn_with(config, ScriptedMembership::allow_all());

    let (session, _pipes) = harness.connect("42").await;
    assert_eq!(harness.bus.user_status("42").as_deref(), Some("online"));

    // Let the cleanup tick and the offline debounce fire.
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(session.is_closed());
    assert_eq!(harness.bus.user_status("42").as_deref(), Some("offline"));

    harness.shutdown().await;
}

#[tokio::test]
async fn publish_outage_still_delivers_locally() {
    let harness = Harness::spawn();
    let (sender, mut sender_pipes) = harness.connect("1").await;
    let (receiver, mut receiver_pipes) = harness.connect("2").await;
    join(&harness, &sender, &mut sender_pipes, "7").await;
    join(&harness, &receiver, &mut receiver_pipes, "7").await;
    let _ = recv_frame(&mut sender_pipes.outbound).await;

    harness.bus.set_publish_failing(true);

    harness
        .send(
            &sender,
            r#"{"id":"m1","type":"channel.message","data":{"channel_id":"7","text":"still here"}}"#,
        )
        .await;

    // The message persists, the receiver still gets it through the local
    // fallback, and the sender is told the cross-instance publish failed.
    let mut saw_message = false;
    let mut saw_publish_failed = false;
    for _ in 0..2 {
        let frame = recv_frame(&mut sender_pipes.outbound).await;
        match frame.payload {
            Payload::ChannelMessage { .. } => saw_message = true,
            Payload::Error { code, .. } => {
                assert_eq!(code, error_codes::PUBLISH_FAILED);
                saw_publish_failed = true;
            },
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert!(saw_message && saw_publish_failed);

    let delivered = recv_frame(&mut receiver_pipes.outbound).await;
    assert!(matches!(delivered.payload, Payload::ChannelMessage { .. }));
    assert_eq!(harness.store.len(), 1);

    // Once the bus recovers, fan-out goes back through it.
    harness.bus.set_publish_failing(false);
    harness
        .send(
            &sender,
            r#"{"id":"m2","type":"channel.message","data":{"channel_id":"7","text":"recovered"}}"#,
        )
        .await;
    let frame = recv_frame(&mut receiver_pipes.outbound).await;
    assert!(matches!(frame.payload, Payload::ChannelMessage { .. }));

    harness.shutdown().await;
}

#[tokio::test]
async fn per_sender_fifo_on_a_channel() {
    let harness = Harness::spawn();
    let (sender, mut sender_pipes) = harness.connect("1").await;
    let (receiver, mut receiver_pipes) = harness.connect("2").await;
    join(&harness, &sender, &mut sender_pipes, "7").await;
    join(&harness, &receiver, &mut receiver_pipes, "7").await;

    for n in 0..5 {
        harness
            .send(
                &sender,
                &format!(
                    r#"{{"id":"m{n}","type":"channel.message","data":{{"channel_id":"7","text":"{n}"}}}}"#
                ),
            )
            .await;
    }

    let mut last = None;
    for _ in 0..5 {
        let frame = recv_frame(&mut receiver_pipes.outbound).await;
        let Payload::ChannelMessage { text, .. } = frame.payload else {
            panic!("expected message");
        };
        let n: u32 = text.unwrap().parse().unwrap();
        if let Some(prev) = last {
            assert!(n > prev, "out of order: {n} after {prev}");
        }
        last = Some(n);
    }

    harness.shutdown().await;
}
