//! Metrics HTTP endpoint
//!
//! Serves the current [`MetricsSnapshot`] as JSON for dashboards and scripts.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

/// Default listen address for the metrics endpoint
pub const METRICS_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 7878);

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind metrics server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Metrics server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Handler for GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Serve metrics on `addr` until the server stops
pub async fn run_metrics_server(metrics: SharedMetrics, addr: SocketAddr) -> Result<(), ServerError> {
    let app = create_metrics_router(metrics);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;

    tracing::info!("Serving metrics on http://{}/metrics", addr);
    axum::serve(listener, app).await.map_err(ServerError::Serve)
}
