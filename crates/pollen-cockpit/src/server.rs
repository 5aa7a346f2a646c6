//! [`CockpitServer`] – the axum HTTP API plus the `/api/events` WebSocket.
//!
//! Listens on `0.0.0.0:3000` by default (see [`CockpitServer::with_port`]).
//! Every route is mounted by [`router`], which is also what the tests drive.

use std::future::Future;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use pollen_middleware::EventBus;
use pollen_types::{Event, PollenError};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::camera::{self, MAX_IMAGE_BYTES};
use crate::error::ApiError;
use crate::pollination;
use crate::state::AppState;

/// Default TCP port for the API.
pub const DEFAULT_PORT: u16 = 3000;

/// Request body ceiling: one maximum-size image plus multipart framing and
/// the text fields.
pub const MAX_BODY_BYTES: usize = MAX_IMAGE_BYTES + 64 * 1024;

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

/// HTTP server exposing the pollination API.
///
/// # Example
///
/// ```rust,no_run
/// # async fn serve(state: pollen_cockpit::AppState) -> Result<(), pollen_types::PollenError> {
/// use pollen_cockpit::CockpitServer;
///
/// CockpitServer::new(state)
///     .with_port(8080)
///     .run_until(async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await
/// # }
/// ```
pub struct CockpitServer {
    state: AppState,
    port: u16,
}

impl CockpitServer {
    /// Create a server for `state` on the [`DEFAULT_PORT`].
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until the process exits.
    ///
    /// # Errors
    ///
    /// [`PollenError::Io`] if the port cannot be bound or the accept loop
    /// fails.
    pub async fn run(self) -> Result<(), PollenError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), PollenError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PollenError::Io(format!("bind error on {addr}: {e}")))?;
        info!(%addr, "pollination API listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| PollenError::Io(format!("server error: {e}")))?;

        info!("pollination API stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Build the full API router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/events", get(events))
        .route("/api/camera/process", post(camera::process_frame))
        .route("/api/camera/frame", post(camera::receive_frame))
        .route("/api/camera/status", get(camera::camera_status))
        .route("/api/pollination/connect", post(pollination::connect))
        .route("/api/pollination/disconnect", post(pollination::disconnect))
        .route("/api/pollination/status", get(pollination::status))
        .route("/api/pollination/pollinate", post(pollination::pollinate))
        .route("/api/pollination/detect", post(pollination::detect))
        .route("/api/pollination/home", post(pollination::home))
        .route("/api/pollination/test", post(pollination::self_test))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connected": state.device.is_connected(),
        "linkState": state.channel.state(),
        "timestamp": Utc::now(),
    }))
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, format!("No route for {uri}"))
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

async fn events(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| bridge_events(socket, state.bus))
}

/// Forward every bus event to one WebSocket client until either side closes.
/// Client messages are read only to notice the close.
async fn bridge_events(socket: WebSocket, bus: EventBus) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut bus_rx = bus.subscribe();

    loop {
        tokio::select! {
            result = bus_rx.recv() => match result {
                Ok(event) => {
                    let Some(message) = event_message(&event) else { continue };
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream client lagged"),
                Err(RecvError::Closed) => break,
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
        }
    }
    debug!("event stream client disconnected");
}

fn event_message(event: &Event) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!(error = %e, "dropping unserialisable event");
            None
        }
    }
}
