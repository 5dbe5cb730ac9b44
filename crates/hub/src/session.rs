//! One live client connection, seen from the hub side.
//!
//! A [`Session`] is a socket-agnostic handle: the gateway owns the WebSocket
//! and runs the two pumps; the hub and cache only ever touch the bounded
//! outbound queue and the cancellation token. Termination is always driven
//! by the token, so "close the socket" and "enqueue a frame" cannot race.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use {
    thiserror::Error,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("session closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

/// The consumer ends handed to the gateway's pumps exactly once.
pub struct SessionPipes {
    /// FIFO of serialized frames, drained by the write pump.
    pub outbound: mpsc::Receiver<String>,
}

pub struct Session {
    session_id: String,
    user_id: String,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    /// One-way: once set, no new frame may be enqueued.
    closed: AtomicBool,
    /// Set by the write pump when it stops draining.
    send_closed: AtomicBool,
    connected_at: Instant,
}

impl Session {
    /// Create a session handle plus the pump-side pipes.
    #[must_use]
    pub fn new(user_id: impl Into<String>, outbound_capacity: usize) -> (Arc<Self>, SessionPipes) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));
        let session = Arc::new(Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            outbound: tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            send_closed: AtomicBool::new(false),
            connected_at: Instant::now(),
        });
        (session, SessionPipes { outbound: rx })
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Best-effort, non-blocking push onto the outbound queue.
    ///
    /// A full queue is terminal: the session flips to closed and the error
    /// tells the caller to schedule an unregister. The queue itself is never
    /// closed from the producer side; the write pump observes cancellation.
    pub fn enqueue(&self, frame: String) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(
                    session_id = %self.session_id,
                    user_id = %self.user_id,
                    "outbound queue full, closing session"
                );
                self.close();
                Err(EnqueueError::Full)
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(EnqueueError::Closed)
            },
        }
    }

    /// Idempotent teardown: cancels the token once. Returns true for the
    /// call that actually performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Called by the write pump as it exits.
    pub fn mark_send_closed(&self) {
        self.send_closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_send_closed(&self) -> bool {
        self.send_closed.load(Ordering::Acquire)
    }

    /// Token observed by both pumps; cancelled exactly once by [`close`].
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
