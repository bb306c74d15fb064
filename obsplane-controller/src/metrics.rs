//! Pull-based health counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use obsplane_cloud::convergence::wait_for_shutdown;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Default)]
pub struct Metrics {
    pub events_processed: AtomicU64,
    pub reconcile_passes: AtomicU64,
    pub convergence_failures: AtomicU64,
    pub resources_created: AtomicU64,
    pub resources_updated: AtomicU64,
    pub resources_deleted: AtomicU64,
}

impl Metrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Text exposition of every counter.
    pub fn render(&self) -> String {
        let counters = [
            ("obsplane_events_processed_total", &self.events_processed),
            ("obsplane_reconcile_passes_total", &self.reconcile_passes),
            (
                "obsplane_convergence_failures_total",
                &self.convergence_failures,
            ),
            ("obsplane_resources_created_total", &self.resources_created),
            ("obsplane_resources_updated_total", &self.resources_updated),
            ("obsplane_resources_deleted_total", &self.resources_deleted),
        ];
        let mut out = String::new();
        for (name, counter) in counters {
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, counter.load(Ordering::Relaxed)));
        }
        out
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

/// Serves `/metrics` until shutdown. A port of `0` disables the endpoint.
pub async fn serve(
    metrics: Arc<Metrics>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if port == 0 {
        info!("metrics endpoint disabled");
        return Ok(());
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind metrics port {}", port))?;
    info!(port, "serving /metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await
        .context("metrics server failed")?;
    Ok(())
}
