//! HTTP exposition server.
//!
//! Serves the Prometheus scrape endpoint plus two small operational routes.
//! Handlers only ever read [`MetricsPublisher`] snapshots, so a scrape never
//! observes a half-applied cycle.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::device::DeviceKind;
use crate::metrics::MetricsPublisher;

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Per-device view returned by `/devices`.
#[derive(Debug, Serialize)]
pub struct DeviceView {
    pub name: String,
    pub kind: DeviceKind,
    pub online: bool,
    pub last_poll: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub power_watts: Option<f64>,
}

pub fn build_router(metrics: Arc<MetricsPublisher>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(get_metrics))
        .route("/devices", get(get_devices))
        .with_state(metrics)
}

async fn get_metrics(State(metrics): State<Arc<MetricsPublisher>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        metrics.render(),
    )
}

async fn get_devices(State(metrics): State<Arc<MetricsPublisher>>) -> Json<Vec<DeviceView>> {
    let views = metrics
        .snapshot()
        .devices
        .into_iter()
        .map(|(name, record)| DeviceView {
            name,
            kind: record.kind,
            online: record.online,
            last_poll: record.last_poll,
            last_success: record.last_success,
            power_watts: record.reading.map(|r| r.snapshot.power_watts),
        })
        .collect();

    Json(views)
}

/// Serve the router on `addr` until `shutdown` changes.
///
/// # Errors
///
/// Returns the I/O error if the listener cannot bind or the server fails.
pub async fn serve(
    addr: SocketAddr,
    metrics: Arc<MetricsPublisher>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Metrics server listening");

    axum::serve(listener, build_router(metrics))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    info!("Metrics server stopped");
    Ok(())
}
