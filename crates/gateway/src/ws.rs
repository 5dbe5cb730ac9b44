//! WebSocket endpoint: upgrade checks, then one read pump and one write
//! pump per connection.
//!
//! Both pumps observe the session's cancellation token, so teardown from
//! any side (read error, write error, queue overflow, hub shutdown, stale
//! eviction) converges on the same path: close, unregister, drain.

use std::sync::Arc;

use {
    axum::{
        extract::{
            Query, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Json, Response},
    },
    futures::{SinkExt, stream::{SplitSink, SplitStream}, StreamExt},
    serde::Deserialize,
    tokio::{sync::mpsc, time::MissedTickBehavior},
    tracing::{debug, info, warn},
};

use {
    roost_hub::{RateDecision, Session},
    roost_protocol::{Frame, error_codes, now_epoch_secs},
};

use crate::{auth::bearer_token, server::AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// `GET /api/v1/ws?userId=<numeric>`
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(verifier) = &state.verifier {
        let authorized = match bearer_token(&headers) {
            Some(token) => verifier.verify(token).await,
            None => false,
        };
        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "code": "UNAUTHORIZED",
                    "message": "invalid or missing bearer token"
                })),
            )
                .into_response();
        }
    }

    // User ids travel as opaque strings everywhere past this point; the
    // endpoint contract just requires the query value to be numeric.
    let user_id = match query.user_id {
        Some(id) if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) => id,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "missing or invalid userId",
                    "field": "userId"
                })),
            )
                .into_response();
        },
    };

    // Reconnect storms burn the per-user socket budget before upgrading.
    match state.limiter.check_socket(&user_id).await {
        Ok(RateDecision::Allowed) => {},
        Ok(RateDecision::Limited) => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "code": error_codes::RATE_LIMITED,
                    "message": "too many connection attempts"
                })),
            )
                .into_response();
        },
        Err(e) => {
            // Fail open: an unreachable bus must not lock everyone out.
            warn!(user_id = %user_id, error = %e, "socket rate-limit check failed, admitting");
        },
    }

    metrics::counter!("roost_ws_upgrades_total").increment(1);
    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id))
}

/// Drive one connection through its full lifecycle:
/// register → pumps → unregister.
async fn handle_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (session, pipes) = Session::new(&user_id, state.config.session.outbound_capacity);
    let session_id = session.session_id().to_string();
    info!(user_id = %user_id, session_id = %session_id, "ws: connection opened");

    if !state
        .hub
        .register(Arc::clone(&session), session_id.clone())
        .await
    {
        warn!(session_id = %session_id, "ws: hub unavailable, dropping connection");
        return;
    }

    let (ws_tx, ws_rx) = socket.split();
    let write = tokio::spawn(write_pump(
        ws_tx,
        pipes.outbound,
        Arc::clone(&session),
        state.clone(),
    ));

    read_pump(ws_rx, Arc::clone(&session), &state).await;

    // Read side is done (error, close, deadline, or cancellation): tear
    // down and give the write pump the grace period to drain.
    session.close();
    state.hub.unregister(&session).await;
    let grace = state.config.session.graceful_grace();
    if tokio::time::timeout(grace, write).await.is_err() {
        warn!(session_id = %session_id, "ws: write pump exceeded grace period");
    }
    info!(user_id = session.user_id(), session_id = %session_id, "ws: connection closed");
}

// ── Read pump ────────────────────────────────────────────────────────────────

async fn read_pump(mut ws_rx: SplitStream<WebSocket>, session: Arc<Session>, state: &AppState) {
    let cancel = session.cancellation();
    let pong_wait = state.config.session.pong_wait();
    let max_frame_bytes = state.config.session.max_frame_bytes;

    loop {
        // A fresh deadline per message: any inbound traffic (frames or
        // transport pongs) counts as liveness.
        let message = tokio::select! {
            () = cancel.cancelled() => return,
            result = tokio::time::timeout(pong_wait, ws_rx.next()) => match result {
                Err(_) => {
                    debug!(session_id = session.session_id(), "ws: read deadline expired");
                    return;
                },
                Ok(None) => return,
                Ok(Some(Err(e))) => {
                    debug!(session_id = session.session_id(), error = %e, "ws: read error");
                    return;
                },
                Ok(Some(Ok(message))) => message,
            },
        };

        match message {
            Message::Text(text) => {
                let text = text.as_str();
                if text.len() > max_frame_bytes {
                    warn!(
                        session_id = session.session_id(),
                        size = text.len(),
                        "ws: oversize frame rejected"
                    );
                    send_error(&session, error_codes::INVALID_MESSAGE, "frame too large");
                    continue;
                }
                match Frame::decode(text.as_bytes()) {
                    Ok(mut frame) => {
                        // Server-stamped identity and time; clients cannot
                        // forge either.
                        frame.user_id = Some(session.user_id().to_string());
                        frame.timestamp = Some(now_epoch_secs());
                        if let Err(e) = state.hub.inbound(Arc::clone(&session), frame).await {
                            warn!(
                                session_id = session.session_id(),
                                error = %e,
                                "ws: dropped frame, hub handoff failed"
                            );
                        }
                    },
                    Err(e) => {
                        debug!(session_id = session.session_id(), error = %e, "ws: bad frame");
                        send_error(&session, e.code(), e.to_string());
                    },
                }
            },
            Message::Binary(_) => {
                send_error(
                    &session,
                    error_codes::INVALID_MESSAGE,
                    "binary frames are not supported",
                );
            },
            // Transport pings are answered by the stack; both directions
            // already reset the deadline above.
            Message::Ping(_) | Message::Pong(_) => {},
            Message::Close(_) => return,
        }
    }
}

fn send_error(session: &Session, code: &str, message: impl Into<String>) {
    let frame = Frame::error(uuid_id(), code, message);
    if let Ok(json) = frame.encode() {
        let _ = session.enqueue(json);
    }
}

fn uuid_id() -> String {
    // Error replies to undecodable frames have no request id to echo.
    uuid::Uuid::new_v4().to_string()
}

// ── Write pump ───────────────────────────────────────────────────────────────

async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    session: Arc<Session>,
    state: AppState,
) {
    let cancel = session.cancellation();
    let write_wait = state.config.session.write_wait();
    let mut ping_tick = tokio::time::interval(state.config.session.ping_period());
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    'pump: loop {
        tokio::select! {
            () = cancel.cancelled() => break 'pump,
            maybe = outbound.recv() => {
                let Some(frame) = maybe else { break 'pump };
                if !send_bounded(&mut ws_tx, Message::Text(frame.into()), write_wait).await {
                    break 'pump;
                }
                // Flush whatever else is already queued in one burst.
                while let Ok(frame) = outbound.try_recv() {
                    if !send_bounded(&mut ws_tx, Message::Text(frame.into()), write_wait).await {
                        break 'pump;
                    }
                }
            },
            _ = ping_tick.tick() => {
                if !send_bounded(&mut ws_tx, Message::Ping(bytes::Bytes::new()), write_wait).await {
                    break 'pump;
                }
            },
        }
    }

    session.mark_send_closed();
    session.close();
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// One socket write under the write deadline. Failure or timeout is
/// terminal for the session.
async fn send_bounded(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: Message,
    write_wait: std::time::Duration,
) -> bool {
    match tokio::time::timeout(write_wait, ws_tx.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "ws: write failed");
            false
        },
        Err(_) => {
            debug!("ws: write deadline expired");
            false
        },
    }
}
