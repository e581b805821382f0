// src/server/mod.rs

//! The HTTP download server (C10): builds the router, binds both listeners
//! (download traffic and metrics), and runs them until shutdown.

pub mod handler;
pub mod metrics_server;
pub mod response;
pub mod state;

use crate::cache::Cache;
use crate::config::ConfigHandle;
use crate::geo::GeoResolver;
use crate::store::Store;
use anyhow::Result;
use axum::routing::get;
use axum::Router;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Builds the router used by the download server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/{*path}", get(handler::download))
        .with_state(state)
}

/// Runs the download server and the metrics server side by side until
/// `shutdown_rx` fires, mirroring the teacher's dual-listener startup.
pub async fn run(
    store: Store,
    cache: Cache,
    geo: Arc<GeoResolver>,
    config: Arc<ConfigHandle>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listen_address = config.get().listen_address.clone();
    let metrics_listen_address = config.get().metrics_listen_address.clone();

    let state = AppState {
        store,
        cache,
        geo,
        config,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_address).await?;
    info!(address = %listen_address, "download server listening");

    let metrics_shutdown = shutdown_rx.resubscribe();
    let metrics_task = tokio::spawn(async move {
        metrics_server::run(&metrics_listen_address, metrics_shutdown).await;
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_rx.recv().await.ok();
        info!("download server shutting down");
    })
    .await?;

    metrics_task.await.ok();
    Ok(())
}
