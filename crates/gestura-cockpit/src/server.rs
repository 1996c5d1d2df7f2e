//! [`CockpitServer`] – HTTP + WebSocket server for producers and dashboards.
//!
//! Listens on `0.0.0.0:5000` (configurable via [`CockpitServer::with_port`]
//! and [`CockpitServer::with_host`]).
//!
//! | Route | Effect |
//! |---|---|
//! | `GET /health` | Liveness plus broker connectivity |
//! | `GET /api/state` | Current snapshot |
//! | `GET /api/history` | Bounded window of recent updates |
//! | `POST /api/robot-status` | Partial update from a gesture producer |
//! | `GET /ws` | Push-channel: snapshot on open, live updates, accepts updates |
//! | `GET /mqtt-status` | Broker adapter status |
//! | `POST /mqtt-reconnect` | Restart the broker session |

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use gestura_middleware::{BrokerStatus, PushChannel, StateRelay};
use gestura_types::{RelayError, RobotState, UpdateSource, is_empty_payload};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Default TCP port, matching the port gesture producers are built against.
pub const DEFAULT_PORT: u16 = 5000;

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

/// HTTP + WebSocket front door of the relay.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use gestura_middleware::{ConnectionRegistry, StateRelay, StateStore};
/// use gestura_cockpit::CockpitServer;
///
/// #[tokio::main]
/// async fn main() {
///     let relay = StateRelay::new(
///         Arc::new(StateStore::default()),
///         Arc::new(ConnectionRegistry::default()),
///     );
///     CockpitServer::new(relay)
///         .run()
///         .await
///         .expect("cockpit server failed");
/// }
/// ```
pub struct CockpitServer {
    relay: StateRelay,
    host: IpAddr,
    port: u16,
}

impl CockpitServer {
    /// Create a server backed by `relay` on `0.0.0.0:`[`DEFAULT_PORT`].
    pub fn new(relay: StateRelay) -> Self {
        Self {
            relay,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the listening address (builder-style).
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The axum router with every route mounted.
    pub fn router(&self) -> Router {
        router(self.relay.clone())
    }

    /// Bind and serve until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unexpected`] if the listener cannot bind or the
    /// server stops with an I/O error.
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), RelayError> {
        let addr = self.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Unexpected(format!("bind error on {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), RelayError> {
        let local = listener
            .local_addr()
            .map_err(|e| RelayError::Unexpected(e.to_string()))?;
        info!(addr = %local, "cockpit listening (websocket endpoint: /ws)");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| RelayError::Unexpected(format!("server error: {e}")))
    }
}

/// Build the router over `relay`.
pub fn router(relay: StateRelay) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/state", get(get_state))
        .route("/api/history", get(get_history))
        .route("/api/robot-status", post(update_robot_status))
        .route("/ws", get(ws_handler))
        .route("/mqtt-status", get(mqtt_status))
        .route("/mqtt-reconnect", post(mqtt_reconnect))
        .with_state(relay)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// [`RelayError`] rendered as `{"error": ...}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::EmptyPayload | RelayError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            RelayError::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::DeliveryFailure(_) | RelayError::Unexpected(_) => {
                error!(error = %self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn health(State(relay): State<StateRelay>) -> Json<Value> {
    let mut body = json!({
        "status": "ok",
        "message": "Robot control server is running",
    });
    if let Some(broker) = relay.broker() {
        body["broker_connected"] = json!(broker.is_connected());
    }
    Json(body)
}

async fn get_state(State(relay): State<StateRelay>) -> Json<RobotState> {
    Json(relay.store().read())
}

async fn get_history(State(relay): State<StateRelay>) -> Json<Value> {
    let store = relay.store();
    Json(json!({
        "revision": store.revision(),
        "records": store.history(),
    }))
}

async fn update_robot_status(
    State(relay): State<StateRelay>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload = parse_body(&body)?;
    debug!(%payload, "robot status received");

    let outcome = relay.ingest(&payload, UpdateSource::Http).await?;
    info!(
        stopped = outcome.snapshot.stopped,
        right = %outcome.snapshot.hand.right.horizontal,
        left_h = %outcome.snapshot.hand.left.horizontal,
        left_v = %outcome.snapshot.hand.left.vertical,
        "robot state updated"
    );

    let mut response = json!({ "status": "ok" });
    if let Some(published) = outcome.broker_published {
        response["broker_published"] = json!(published);
    }
    if let Some(connected) = outcome.broker_connected {
        response["broker_connected"] = json!(connected);
    }
    Ok(Json(response))
}

/// Decode an HTTP body into an update payload.
fn parse_body(body: &[u8]) -> Result<Value, RelayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(RelayError::EmptyPayload);
    }
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidPayload(format!("body is not valid JSON: {e}")))?;
    if is_empty_payload(&payload) {
        return Err(RelayError::EmptyPayload);
    }
    Ok(payload)
}

async fn mqtt_status(State(relay): State<StateRelay>) -> Json<BrokerStatus> {
    Json(match relay.broker() {
        Some(broker) => broker.status(),
        None => BrokerStatus::not_configured(),
    })
}

async fn mqtt_reconnect(State(relay): State<StateRelay>) -> Result<Json<BrokerStatus>, ApiError> {
    let broker = relay
        .broker()
        .ok_or_else(|| RelayError::BrokerUnavailable("no broker configured".to_string()))?;
    broker.reinitialize();
    let connected = broker.wait_connected().await;
    info!(connected, "broker reconnect requested over HTTP");
    Ok(Json(broker.status()))
}

// ---------------------------------------------------------------------------
// Push-channel
// ---------------------------------------------------------------------------

async fn ws_handler(State(relay): State<StateRelay>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_push_channel(socket, relay))
}

/// Serve one dashboard connection until either side closes it.
async fn handle_push_channel(socket: WebSocket, relay: StateRelay) {
    let PushChannel { id, mut frames } = relay.attach();
    info!(connection = %id, connections = relay.registry().len(), "push-channel opened");

    let (mut sink, mut stream) = socket.split();

    // ── Downstream: registry queue → socket ─────────────────────────────────
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // ── Upstream: socket → relay ────────────────────────────────────────────
    let upstream = relay.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    upstream.ingest_text(text.as_str(), UpdateSource::PushChannel).await;
                }
                Ok(Message::Binary(bytes)) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        upstream.ingest_text(text, UpdateSource::PushChannel).await;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "push-channel read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    relay.detach(id);
    info!(connection = %id, connections = relay.registry().len(), "push-channel closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
