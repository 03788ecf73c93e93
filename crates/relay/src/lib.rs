//! lims-relay: the websocket hub between web observers and station workers.
//!
//! Routes:
//! - `GET /ws/relay/{client_id}`: a device or web client with a declared id
//! - `GET /ws/relay`: an anonymous web client (`web_<random>`)
//! - `GET /ws/room/{room}`: room broadcast, every frame to every member
//! - `GET /health`: connection and group counts
//!
//! The hub does routing only. `device_status_update` goes to every web
//! observer, `send_to_client` goes to one client's private group and is
//! acknowledged to the sender, anything else gets an "unknown command"
//! reply.

pub mod hub;
pub mod session;
mod state;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use lims_protocol::ClientIdentity;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use hub::{ConnId, Hub};
pub use state::RelayState;

pub fn router(state: Arc<RelayState>) -> Router {
    // Permissive for local development.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ws/relay", get(handle_anonymous))
        .route("/ws/relay/{client_id}", get(handle_client))
        .route("/ws/room/{room}", get(handle_room))
        .fallback(handle_not_found)
        .layer(cors)
        .with_state(state)
}

async fn handle_health(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let groups = state.hub.snapshot().await;
    let body = serde_json::json!({
        "status": "ok",
        "connections": state.connections(),
        "observers": groups.get(lims_protocol::OBSERVER_GROUP).copied().unwrap_or(0),
        "groups": groups.len(),
    });
    (StatusCode::OK, Json(body))
}

async fn handle_not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "not found"})))
}

async fn handle_client(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Path(client_id): Path<String>,
) -> Response {
    let identity = ClientIdentity::from_route(Some(&client_id));
    ws.on_upgrade(move |socket| session::run_relay(socket, state, identity))
}

async fn handle_anonymous(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> Response {
    let identity = ClientIdentity::from_route(None);
    ws.on_upgrade(move |socket| session::run_relay(socket, state, identity))
}

async fn handle_room(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    Path(room): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| session::run_room(socket, state, room))
}

/// Serve the relay on an already-bound listener until `shutdown` resolves.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<RelayState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "relay listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Bind `0.0.0.0:{port}` and serve until Ctrl+C.
pub async fn start_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    serve_on(listener, Arc::new(RelayState::new()), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;
    info!("relay stopped");
    Ok(())
}
