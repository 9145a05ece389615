//! HTTP and WebSocket surface over the orchestrator and queues.

pub mod api;
pub mod ws;

use crate::error::Result;
use crate::notify::WebhookNotifier;
use crate::orchestrator::BuildOrchestrator;
use crate::progress::ProgressHub;
use axum::Router;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared handler state.
pub struct AppState {
    pub orchestrator: Arc<BuildOrchestrator>,
    pub hub: Arc<ProgressHub>,
    /// Present when webhooks are configured; its queue stats are reported.
    pub notifier: Option<Arc<WebhookNotifier>>,
}

pub type SharedState = Arc<AppState>;

/// The full router: REST API plus the `/ws` progress channel.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn serve(addr: SocketAddr, state: SharedState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "HTTP server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
