//! Prometheus metrics for the ingestion server.
//!
//! Installs a global metrics recorder and serves the rendered output on a separate
//! socket address. The recorded series are:
//!
//! - `fitbit_uploads_total{kind, outcome}` -- successful uploads.
//! - `fitbit_upload_rejections_total{reason}` -- failed uploads by error reason.
//! - `fitbit_normalizations_total{result}` -- normalization jobs.
//! - `fitbit_recordings_tracked` -- motion recordings currently receiving batches.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics recorder already installed")]
    AlreadyInstalled,
}

/// Renders the process-wide Prometheus registry.
#[derive(Clone, Debug)]
pub struct MetricsHandle(PrometheusHandle);

impl MetricsHandle {
    pub fn render(&self) -> String {
        self.0.render()
    }
}

static INSTALLED: OnceLock<MetricsHandle> = OnceLock::new();

fn describe() {
    metrics::describe_counter!(
        "fitbit_uploads_total",
        "Uploads handled successfully, by sensor kind and outcome"
    );
    metrics::describe_counter!(
        "fitbit_upload_rejections_total",
        "Uploads rejected or failed, by error reason"
    );
    metrics::describe_counter!(
        "fitbit_normalizations_total",
        "Normalization jobs, by result"
    );
    metrics::describe_gauge!(
        "fitbit_recordings_tracked",
        "Motion recordings currently receiving batches"
    );
}

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// # Errors
///
/// Returns [`MetricsError::AlreadyInstalled`] if any global recorder is already set;
/// [`get_installed_handle`] still returns the first one installed here.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = MetricsHandle(recorder.handle());
    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
    let _ = INSTALLED.set(handle.clone());
    describe();
    Ok(handle)
}

pub fn get_installed_handle() -> Option<MetricsHandle> {
    INSTALLED.get().cloned()
}

async fn scrape(State(handle): State<MetricsHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

fn metrics_router(handle: MetricsHandle) -> Router {
    Router::new().route("/metrics", get(scrape)).with_state(handle)
}

/// Serve `GET /metrics` on `addr` in a background task.
///
/// A bind failure is logged and the task ends; ingestion keeps running without
/// metrics.
pub fn serve_metrics(handle: MetricsHandle, addr: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => run_metrics_server(handle, listener).await,
            Err(e) => tracing::error!(addr = %addr, error = %e, "Failed to bind metrics listener"),
        }
    })
}

/// Like [`serve_metrics`], on a listener the caller already bound.
pub fn serve_metrics_on_listener(handle: MetricsHandle, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(run_metrics_server(handle, listener))
}

async fn run_metrics_server(handle: MetricsHandle, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Metrics server listening");
    }
    if let Err(e) = axum::serve(listener, metrics_router(handle)).await {
        tracing::error!(error = %e, "Metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn second_install_returns_already_installed() {
        let _ = install_recorder();
        let err = install_recorder().unwrap_err();
        assert!(
            matches!(err, MetricsError::AlreadyInstalled),
            "error should be AlreadyInstalled, got: {err:?}"
        );
        assert!(get_installed_handle().is_some());
    }

    #[tokio::test]
    async fn serve_metrics_on_listener_stays_running() {
        let _ = install_recorder();
        let handle = get_installed_handle().expect("recorder should be installed");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let join_handle = serve_metrics_on_listener(handle, listener);

        let timeout_result = tokio::time::timeout(Duration::from_millis(20), join_handle).await;
        assert!(
            timeout_result.is_err(),
            "metrics server should still be running after 20ms"
        );
    }

    #[tokio::test]
    async fn serve_metrics_bind_failure_resolves() {
        let _ = install_recorder();
        let handle = get_installed_handle().expect("recorder should be installed");

        let taken = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = taken.local_addr().expect("should have local addr");

        let join_handle = serve_metrics(handle, addr);
        tokio::time::timeout(Duration::from_secs(2), join_handle)
            .await
            .expect("task should finish on bind failure")
            .expect("task should not panic");
    }
}
