use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::registry::{BroadcastReport, Registry};

pub struct RelayState {
    config: RelayConfig,
    registry: Registry,
    metrics: Option<PrometheusHandle>,
    totals: Totals,
}

#[derive(Default)]
struct Totals {
    connections: AtomicU64,
    messages_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    overflow_evictions: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_messages_forwarded: u64,
    pub total_bytes_forwarded: u64,
    pub total_overflow_evictions: u64,
    pub total_evictions: u64,
}

impl RelayState {
    /// `metrics` is `None` when no Prometheus recorder is installed, in which
    /// case `/metrics` answers 404.
    pub fn new(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Self {
        let registry = Registry::new(config.queue_depth);
        Self {
            config,
            registry,
            metrics,
            totals: Totals::default(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> StatsResponse {
        StatsResponse {
            active_connections: self.registry.len(),
            total_connections: self.totals.connections.load(Ordering::Relaxed),
            total_messages_forwarded: self.totals.messages_forwarded.load(Ordering::Relaxed),
            total_bytes_forwarded: self.totals.bytes_forwarded.load(Ordering::Relaxed),
            total_overflow_evictions: self.totals.overflow_evictions.load(Ordering::Relaxed),
            total_evictions: self.totals.evictions.load(Ordering::Relaxed),
        }
    }

    fn on_connection_added(&self, active: usize) {
        self.totals.connections.fetch_add(1, Ordering::Relaxed);
        counter!("rendezvous_relay_connections_total", 1);
        gauge!("rendezvous_relay_connections_active", active as f64);
    }

    fn on_connection_removed(&self, active: usize) {
        counter!("rendezvous_relay_connections_closed_total", 1);
        gauge!("rendezvous_relay_connections_active", active as f64);
    }

    fn record_broadcast(&self, report: &BroadcastReport) {
        if report.delivered > 0 {
            self.totals
                .messages_forwarded
                .fetch_add(report.delivered as u64, Ordering::Relaxed);
            self.totals
                .bytes_forwarded
                .fetch_add(report.bytes as u64, Ordering::Relaxed);
            counter!(
                "rendezvous_relay_messages_forwarded_total",
                report.delivered as u64
            );
            counter!("rendezvous_relay_bytes_forwarded_total", report.bytes as u64);
        }
        if report.overflowed > 0 {
            self.totals
                .overflow_evictions
                .fetch_add(report.overflowed as u64, Ordering::Relaxed);
        }
        if report.closed > 0 {
            self.totals
                .evictions
                .fetch_add(report.closed as u64, Ordering::Relaxed);
        }
        if report.overflowed > 0 || report.closed > 0 {
            gauge!(
                "rendezvous_relay_connections_active",
                self.registry.len() as f64
            );
        }
    }

    fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves. Live connections
/// are then asked to close and get the configured grace period to do so.
pub async fn serve<S>(listener: TcpListener, state: Arc<RelayState>, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let grace = state.config.shutdown_grace;
    let registry = state.registry.clone();
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown = async move {
        shutdown.await;
        let closed = registry.close_all("relay shutting down");
        info!(
            closed,
            grace_seconds = grace.as_secs(),
            "shutdown signal received; closing connections"
        );
        let _ = signalled_tx.send(());
    };

    let server = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result.context("relay server error"),
        _ = async {
            if signalled_rx.await.is_ok() {
                tokio::time::sleep(grace).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!("grace period elapsed with connections still open");
            Ok(())
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    match state.render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, remote_addr))
}

async fn handle_connection(socket: WebSocket, state: Arc<RelayState>, remote_addr: SocketAddr) {
    let connection_id = Uuid::new_v4();
    let registration = state.registry.register(connection_id);
    state.on_connection_added(registration.active_connections);
    let mut rx = registration.receiver;
    let mut closed = registration.closed;

    info!(
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        active = registration.active_connections,
        "websocket connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = &mut closed => {
                    // An error means the connection was unregistered.
                    if let Ok(frame) = frame {
                        debug!(
                            connection_id = %connection_id,
                            code = frame.code,
                            reason = %frame.reason,
                            "closing websocket"
                        );
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    }
                    break;
                }
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    if ws_tx.send(message).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = &mut writer => {
                debug!(connection_id = %connection_id, "writer gone; dropping connection");
                break;
            }
        };
        match message {
            None => break,
            Some(Ok(Message::Close(frame))) => {
                info!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Some(Ok(frame @ (Message::Text(_) | Message::Binary(_)))) => {
                let report = state.registry.broadcast(connection_id, frame);
                state.record_broadcast(&report);
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        }
    }

    let active = state.registry.unregister(connection_id);
    state.on_connection_removed(active);
    writer.abort();

    info!(connection_id = %connection_id, active, "websocket disconnected");
}
