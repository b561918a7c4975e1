//! Telecare Relay Server
//!
//! A lightweight WebSocket relay that lets two clients of the telehealth
//! app establish a live audio/video session:
//!
//! 1. **Presence registry**: maps durable user ids to the ephemeral
//!    WebSocket connection currently owned by that user, rebuilt purely
//!    from connect/disconnect traffic.
//!
//! 2. **Signaling relay**: forwards session-description offers/answers,
//!    connectivity candidates, and teardown messages between exactly two
//!    participants. Fire-and-forget, at-most-once: no queueing, no
//!    retries, no server-side call timeout.
//!
//! The relay never inspects offer/answer/candidate content; call
//! semantics live entirely in the clients.

mod handler;
mod protocol;
mod state;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "telecare-relay", version, about = "Telecare signaling relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// Server region label (e.g. "US East", "EU West")
    #[arg(long, default_value = "US East", env = "RELAY_REGION")]
    region: String,

    /// Server location / city (e.g. "New York", "Frankfurt")
    #[arg(long, default_value = "New York", env = "RELAY_LOCATION")]
    location: String,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telecare_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        port: args.port,
        region: args.region,
        location: args.location,
    };

    let state = RelayState::new(config);

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/info", get(info_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Telecare relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "telecare-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "online_clients": state.online_count(),
        "active_calls": state.active_call_count(),
    }))
}

/// Server info endpoint: returns metadata including region and location.
/// Also useful for client-side ping measurement (time the round-trip).
async fn info_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "service": "telecare-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "region": state.config.region,
        "location": state.config.location,
        "online_clients": state.online_count(),
        "active_calls": state.active_call_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
