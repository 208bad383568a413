//! HTTP server for Prometheus metrics and pipeline health
//!
//! Runs a lightweight HTTP server on a separate port:
//! - `GET /metrics` Prometheus text format
//! - `GET /health` per-stream health as JSON (503 when any stream is degraded)
//! - `GET /snapshot` current [`MetricsSnapshot`](crate::metrics::MetricsSnapshot) as JSON
//!
//! # Example
//!
//! ```ignore
//! let metrics_handle = MetricsServer::start(9090, handle.context());
//!
//! // Later, to shutdown
//! metrics_handle.abort();
//! ```

use crate::pipeline::PipelineContext;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on the given port
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    /// The server runs until aborted or the process exits.
    pub fn start(port: u16, ctx: Arc<PipelineContext>) -> JoinHandle<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        tokio::spawn(async move {
            let app = router(ctx);

            info!(port = port, "Metrics server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, port = port, "Failed to bind metrics server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router(ctx: Arc<PipelineContext>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/snapshot", get(snapshot_handler))
        .with_state(ctx)
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /health endpoint
async fn health_handler(State(ctx): State<Arc<PipelineContext>>) -> impl IntoResponse {
    let report = ctx.health();
    let status = if report.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Handler for /snapshot endpoint
async fn snapshot_handler(State(ctx): State<Arc<PipelineContext>>) -> impl IntoResponse {
    Json(ctx.snapshot())
}
