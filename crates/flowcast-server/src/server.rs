//! `FlowServer`: Axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};
use crate::health::{self, HealthResponse};
use crate::publisher::{EventBridge, FlowPublisher, flow_channel};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::Broadcaster;
use crate::websocket::heartbeat::LivenessMonitor;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Per-connection outbound queue length.
    pub send_queue_capacity: usize,
    /// Max inbound `WebSocket` message size.
    pub max_message_size: usize,
}

/// The flow fan-out server.
pub struct FlowServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    publisher: FlowPublisher,
    bridge: Mutex<Option<EventBridge>>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl FlowServer {
    /// Create a server. Nothing is bound until [`listen`](Self::listen).
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let (publisher, rx) = flow_channel(config.publish_queue_capacity);
        let bridge = EventBridge::new(rx, broadcaster);
        Self {
            config,
            registry,
            publisher,
            bridge: Mutex::new(Some(bridge)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from this Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            send_queue_capacity: self.config.send_queue_capacity,
            max_message_size: self.config.max_message_size,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the listener and start the HTTP server, publish bridge and
    /// liveness monitor.
    ///
    /// Stop everything with [`shutdown`](Self::shutdown) and
    /// [`ShutdownCoordinator::graceful_shutdown`] on the returned tasks.
    pub async fn listen(&self) -> Result<ServerHandle> {
        let bind_addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;

        let token = self.shutdown.token();
        let mut tasks = Vec::with_capacity(3);

        let router = self.router();
        let registry = self.registry.clone();
        let serve_token = token.clone();
        tasks.push(tokio::spawn(async move {
            let signal = async move {
                serve_token.cancelled().await;
                let closed = registry.close_all().await;
                info!(closed, "closed subscriber connections");
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                warn!(error = %e, "http server exited with error");
            }
        }));

        if let Some(bridge) = self.bridge.lock().take() {
            tasks.push(tokio::spawn(bridge.run(token.clone())));
        } else {
            warn!("publish bridge already running, not starting another");
        }

        let monitor = LivenessMonitor::new(self.registry.clone(), self.config.heartbeat_interval());
        let heartbeat_interval_ms = u64::try_from(monitor.period().as_millis()).unwrap_or(u64::MAX);
        tasks.push(tokio::spawn(monitor.run(token)));

        info!(
            %addr,
            heartbeat_interval_ms,
            max_connections = self.config.max_connections,
            "flowcast server listening"
        );
        Ok(ServerHandle { addr, tasks })
    }

    /// Handle for submitting flow events.
    pub fn publisher(&self) -> FlowPublisher {
        self.publisher.clone()
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Returned by [`FlowServer::listen`].
pub struct ServerHandle {
    addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `ws://` URL of the subscriber endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Background task handles, for graceful shutdown.
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        self.tasks
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if state.registry.connection_count().await >= state.registry.max_connections() {
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }
    let registry = state.registry.clone();
    let capacity = state.send_queue_capacity;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, registry, capacity))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.registry.connection_count().await;
    Json(health::health_check(
        state.start_time,
        connections,
        state.registry.max_connections(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
