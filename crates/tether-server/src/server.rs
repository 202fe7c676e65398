//! `TetherServer`: axum router, listener, reaper and shutdown wiring.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::handler::UpgradeRequest;
use crate::health::{self, HealthResponse};
use crate::metrics::{self as server_metrics, WS_REJECTIONS_TOTAL};
use crate::reaper::Reaper;
use crate::session;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::ws::{self, Heartbeat};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Handler and hub.
    pub dispatcher: Arc<Dispatcher>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// HTTP front end for a [`Dispatcher`].
pub struct TetherServer {
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl TetherServer {
    /// Create a server around `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Build the router: the socket path from settings, `/health`, `/metrics`.
    pub fn router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };
        let path = self.dispatcher.hub().settings().server.path.clone();

        Router::new()
            .route(&path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address, start serving and start the reaper.
    pub async fn listen(self) -> std::io::Result<ServerHandle> {
        let settings = self.dispatcher.hub().settings();
        let addr = format!("{}:{}", settings.server.host, settings.server.port);
        let interval = settings.connections.disconnect_timeout();

        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();

        let token = self.shutdown.token();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(error = %err, "server error");
            }
        });
        let reaper = Reaper::spawn(self.dispatcher.clone(), interval, self.shutdown.token());

        info!(%local_addr, path = %settings.server.path, "tether server listening");
        Ok(ServerHandle {
            addr: local_addr,
            dispatcher: self.dispatcher,
            shutdown: self.shutdown,
            tasks: vec![server, reaper],
        })
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownCoordinator>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stop accepting, stop the reaper, disconnect every connection, and
    /// wait up to `timeout` for the background tasks.
    ///
    /// Connections that finish their upgrade while the listener drains are
    /// caught by a second pass once the listener task has stopped.
    ///
    /// Returns the number of connections that were closed.
    pub async fn shutdown(self, timeout: Option<Duration>) -> usize {
        info!("shutting down");
        self.shutdown.shutdown();
        let mut closed = self.dispatcher.shutdown().await;
        let _ = self.shutdown.graceful_shutdown(self.tasks, timeout).await;
        let late = self.dispatcher.shutdown().await;
        if late > 0 {
            debug!(late, "closed connections registered during shutdown");
        }
        closed += late;
        info!(closed, "shutdown complete");
        closed
    }
}

/// GET {path}: authorize, then upgrade.
///
/// Requests that are not WebSocket upgrades are rejected by the extractor
/// before authorization runs.
async fn ws_handler(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request = UpgradeRequest {
        path: uri.path().to_owned(),
        query,
        headers: header_map(&headers),
    };
    if !state.dispatcher.authorize(&request).await {
        metrics::counter!(WS_REJECTIONS_TOTAL).increment(1);
        debug!(path = %request.path, "upgrade request denied");
        return StatusCode::FORBIDDEN.into_response();
    }

    let connections = &state.dispatcher.hub().settings().connections;
    let buffer_size = connections.buffer_size;
    let heartbeat = Heartbeat::from_settings(connections);
    let dispatcher = state.dispatcher;
    upgrade
        .read_buffer_size(buffer_size)
        .on_upgrade(move |socket| async move {
            let transport = ws::split(socket, heartbeat);
            let _ = session::run_authorized(dispatcher, request.query, transport).await;
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.dispatcher.hub().count();
    Json(health::health_check(state.start_time, connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => server_metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
