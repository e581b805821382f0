// src/server/metrics_server.rs

//! Exposes Prometheus metrics on a dedicated listener, separate from the
//! download server, following the teacher's split between the data-plane
//! port and the metrics port.

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use tokio::sync::broadcast;
use tracing::{error, info};

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        crate::metrics::render(),
    )
}

/// Runs the metrics HTTP server until `shutdown_rx` fires.
pub async fn run(listen_address: &str, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = Router::new().route("/metrics", get(metrics_handler));

    let listener = match tokio::net::TcpListener::bind(listen_address).await {
        Ok(l) => l,
        Err(e) => {
            error!(address = listen_address, error = %e, "failed to bind metrics server");
            return;
        }
    };

    info!(address = listen_address, "metrics server listening on /metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("metrics server shutting down");
        })
        .await
        .ok();
}
