//! obsplane-controller: reconciliation controller for the observability
//! platform.
//!
//! This daemon:
//! - Connects to the cluster API and the cloud provider APIs
//! - Ensures the tenant store exists and fetches the tenant collection
//! - Starts per-kind informers merged into one event stream
//! - Blocks until the observed-state cache is fully hydrated
//! - Reconciles desired vs. observed state on every event or timer tick
//! - Exposes health counters on /metrics

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use obsplane_cloud::http::{HttpProvider, ProviderEndpoints};
use obsplane_cloud::sequencer::{CloudProviders, DependencySequencer};

use obsplane_controller::cluster::HttpClusterClient;
use obsplane_controller::config::ControllerConfig;
use obsplane_controller::desired::WATCHED_KINDS;
use obsplane_controller::informer::run_informers;
use obsplane_controller::metrics::{self, Metrics};
use obsplane_controller::reconciler::Reconciler;
use obsplane_controller::state::ObservedClusterState;
use obsplane_controller::tenants::{TenantStore, run_tenant_sync};

/// obsplane reconciliation controller
#[derive(Parser, Debug)]
#[command(name = "obsplane-controller", version, about)]
struct Args {
    /// Canonical cluster name
    cluster_name: String,

    /// Cloud project the cluster lives in
    #[arg(long)]
    project: String,

    /// Cloud region for regional resources
    #[arg(long, default_value = "us-west2")]
    region: String,

    /// CIDR range for the cluster subnetwork
    #[arg(long, default_value = "10.0.0.0/20")]
    subnet_cidr: String,

    /// Cluster API base URL
    #[arg(long, default_value = "http://127.0.0.1:8001")]
    cluster_api: String,

    /// File holding the cluster API bearer token
    #[arg(long)]
    cluster_token_file: Option<PathBuf>,

    /// File holding the cloud provider bearer token
    #[arg(long)]
    cloud_token_file: Option<PathBuf>,

    /// Namespace holding the controller's own objects
    #[arg(long, default_value = "obsplane-system")]
    namespace: String,

    /// Retention in days for the metrics bucket
    #[arg(long, default_value = "14")]
    metrics_retention_days: u32,

    /// Retention in days for the logs bucket
    #[arg(long, default_value = "30")]
    logs_retention_days: u32,

    /// Seconds between drift-catching reconciliation passes
    #[arg(long, default_value = "300")]
    reconcile_interval: u64,

    /// Port for the /metrics endpoint (0 disables)
    #[arg(long, default_value = "8900")]
    metrics_port: u16,
}

fn read_token(path: &Option<PathBuf>, what: &str) -> Result<Option<String>> {
    match path {
        Some(path) => {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {} token from {}", what, path.display()))?;
            Ok(Some(token.trim().to_string()))
        }
        None => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "obsplane_controller=info,obsplane_cloud=info,tower=warn,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!(cluster = %args.cluster_name, "starting obsplane controller");

    let config = ControllerConfig {
        cluster_name: args.cluster_name.clone(),
        project: args.project.clone(),
        region: args.region.clone(),
        subnet_cidr: args.subnet_cidr.clone(),
        namespace: args.namespace.clone(),
        metrics_retention_days: args.metrics_retention_days,
        logs_retention_days: args.logs_retention_days,
        reconcile_interval: Duration::from_secs(args.reconcile_interval),
        metrics_port: args.metrics_port,
    };

    // Credential loading is the only startup step allowed to kill the
    // process; everything after this recovers in-loop.
    let cluster_token = read_token(&args.cluster_token_file, "cluster API")?;
    let cloud_token = read_token(&args.cloud_token_file, "cloud provider")?;

    let http = reqwest::Client::new();
    let mut cluster_client = HttpClusterClient::new(http.clone(), &args.cluster_api);
    if let Some(token) = cluster_token {
        cluster_client = cluster_client.with_token(token);
    }
    let cluster_api = Arc::new(cluster_client);

    let mut provider = HttpProvider::new(http, ProviderEndpoints::default(), &args.project);
    if let Some(token) = cloud_token {
        provider = provider.with_token(token);
    }
    let provider = Arc::new(provider);
    let sequencer = DependencySequencer::new(CloudProviders {
        compute: provider.clone(),
        storage: provider.clone(),
        iam: provider,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let metrics = Metrics::shared();
    let metrics_handle = tokio::spawn(metrics::serve(
        metrics.clone(),
        config.metrics_port,
        shutdown_rx.clone(),
    ));

    info!("fetching tenants");
    let store = TenantStore::new(cluster_api.clone(), &config.namespace);
    let tenants = store.fetch().await.map_err(|e| {
        anyhow::anyhow!("cannot reach the cluster API for the tenant store: {}", e)
    })?;
    info!(count = tenants.len(), "tenant collection loaded");

    let state = ObservedClusterState::shared();
    let (events_tx, events_rx) = mpsc::channel(256);
    let informer_handle = tokio::spawn(run_informers(
        cluster_api.clone(),
        state.clone(),
        WATCHED_KINDS,
        events_tx,
        shutdown_rx.clone(),
    ));

    let sync_handle = tokio::spawn(run_tenant_sync(
        TenantStore::new(cluster_api.clone(), &config.namespace),
        tenants,
        shutdown_rx.clone(),
    ));

    let reconciler = Reconciler::new(
        cluster_api,
        state,
        store,
        metrics,
        sequencer,
        config,
        shutdown_rx,
    );
    reconciler.run(events_rx).await?;

    let _ = informer_handle.await;
    let _ = sync_handle.await;
    match metrics_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "metrics server error"),
        Err(e) => error!(error = %e, "metrics task panicked"),
    }
    info!("controller stopped");
    Ok(())
}
