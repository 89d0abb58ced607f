mod routes;

use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{sentinel::Sentinel, Result};

/// Read-only HTTP surface over the sentinel.
pub struct Server {
    sentinel: Arc<Sentinel>,
}

impl Server {
    pub fn new(sentinel: Arc<Sentinel>) -> Self {
        Self { sentinel }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route("/runs", get(routes::list_active_runs))
            .route("/runs/{id}", get(routes::get_run))
            .route("/runs/{id}/anomalies", get(routes::list_anomalies))
            .layer(TraceLayer::new_for_http())
            .with_state(self.sentinel)
    }

    pub async fn start(self, addr: &str, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("HTTP API listening on {}", listener.local_addr()?);
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
