//! The process-local connection hub: session lifecycle, connection cache,
//! message state machine, and the cross-instance bridge.
//!
//! One [`Hub`] per process owns the [`ConnectionCache`] and serializes every
//! register/unregister/inbound event through a single event loop. Sessions
//! are socket-agnostic handles; the gateway owns the sockets and pumps.

pub mod bridge;
pub mod cache;
pub mod circuit;
pub mod error;
pub mod hub;
pub mod limiter;
pub mod session;
pub mod store;

pub use {
    bridge::Bridge,
    cache::{BroadcastOutcome, ConnectionCache, ConnectionMetadata},
    circuit::CircuitBreaker,
    error::{Error, HubError, Result},
    hub::{Hub, HubContext, HubEvent, HubHandle, HubState},
    limiter::{RateDecision, RateLimiter},
    session::{EnqueueError, Session, SessionPipes},
    store::{
        AllowAllMembership, ChatMessage, MembershipOracle, MemoryMessageStore, MessageStore,
        NewChatMessage,
    },
};
