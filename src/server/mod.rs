//! WebSocket transport: one persistent duplex connection per client.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tracing::info;

pub mod messages;
pub mod ws;

pub use ws::AppState;

/// Build the HTTP router: the WebSocket endpoint plus a health probe.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(bind_addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "websocket server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
