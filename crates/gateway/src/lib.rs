//! HTTP/WebSocket front door: the `/api/v1/ws` upgrade endpoint, the
//! session pumps, and the health view.

pub mod auth;
pub mod server;
pub mod ws;

pub use {
    auth::TokenVerifier,
    server::{AppState, build_router, serve},
};
