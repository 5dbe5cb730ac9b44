//! Router assembly and the HTTP listener.

use std::sync::Arc;

use {
    axum::{Router, extract::State, response::Json, routing::get},
    tokio_util::sync::CancellationToken,
    tower_http::{
        catch_panic::CatchPanicLayer,
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

use {
    roost_common::HealthMonitor,
    roost_config::RoostConfig,
    roost_hub::{HubHandle, RateLimiter},
};

use crate::auth::TokenVerifier;

/// Gateway runtime state shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub limiter: Arc<RateLimiter>,
    pub health: Arc<HealthMonitor>,
    pub verifier: Option<Arc<dyn TokenVerifier>>,
    pub config: Arc<RoostConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ws", get(crate::ws::ws_handler))
        .route("/api/v1/health", get(health_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Bind and serve until the shutdown token fires. A bind failure is the
/// one fatal startup error.
pub async fn serve(
    state: AppState,
    bind: &str,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    info!(addr = %addr, "gateway listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let report = state.health.report();
    Json(serde_json::json!({
        "status": report.status,
        "connections": report.active_connections,
        "error_rate": report.error_rate,
        "last_error": report.last_error,
        "bridge_circuit_open": report.bridge_circuit_open,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
