//! Prometheus scrape endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum::routing::get;
use rolesync_core::{Error, Result};
use rolesync_reconciler::{PrometheusMetrics, ShutdownSignal};
use tokio::net::TcpListener;
use tracing::info;

const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response(),
    }
}

fn router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serve `GET /metrics` on `listen_addr` until shutdown.
///
/// # Errors
///
/// Returns `InvalidConfig` when the address does not parse or cannot be bound.
pub async fn serve_metrics(
    listen_addr: &str,
    metrics: Arc<PrometheusMetrics>,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .map_err(|e| Error::invalid_config(format!("metrics.listen_addr '{listen_addr}': {e}")))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::invalid_config(format!("cannot bind metrics endpoint {addr}: {e}")))?;
    info!(%addr, "Metrics endpoint listening");

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::invalid_config(format!("metrics endpoint failed: {e}")))
}
