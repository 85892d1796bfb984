use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Router};
use tower_http::trace::TraceLayer;

use crate::backend::LocalBackend;
use crate::config::{ChatConfig, ServerConfig};
use crate::connection::{run_connection, ConnectionParams};
use crate::router::ServiceRegistry;

/// Shared state accessible by handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub config: ServerConfig,
    pub chat: Arc<ChatConfig>,
    pub registry: ServiceRegistry,
    pub backend: Arc<LocalBackend>,
}

/// Build the axum router for the WS server.
///
/// The router exposes `/ws` (WebSocket upgrade) and `/health`.
/// Callers should use `into_make_service_with_connect_info::<SocketAddr>()`
/// when binding so upgrades can be logged with the peer address.
pub fn build_router(
    config: ServerConfig,
    chat: Arc<ChatConfig>,
    backend: Arc<LocalBackend>,
) -> Router {
    let mut registry = ServiceRegistry::new();
    registry.register("profiles", "1.0");
    registry.register("rooms", "1.0");
    registry.register("messages", "1.0");

    let state = AppState {
        config,
        chat,
        registry,
        backend,
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(
    State(state): State<AppState>,
    remote: Option<Extension<ConnectInfo<SocketAddr>>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match remote {
        Some(Extension(ConnectInfo(addr))) => tracing::info!(remote = %addr, "ws upgrade accepted"),
        None => tracing::info!("ws upgrade accepted"),
    }

    let params = ConnectionParams {
        config: state.config.clone(),
        chat: state.chat.clone(),
        registry: state.registry.clone(),
        backend: state.backend.clone(),
    };

    ws.on_upgrade(move |socket| run_connection(socket, params))
        .into_response()
}
