//! kong-ingress controller binary

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kong_ingress::config::Config;
use kong_ingress::controller::{Informers, KongController};
use kong_ingress::crd::Domain;
use kong_ingress::events::KubeEventPublisher;
use kong_ingress::identity::HttpIdentityProvider;
use kong_ingress::kong::RestKongAdmin;
use kong_ingress::orchestrator::KubeOrchestrator;

/// Bridge Kubernetes ingress resources onto a Kong gateway
#[derive(Parser, Debug)]
#[command(name = "kong-ingress", version, about, long_about = None)]
struct Cli {
    /// Generate the Domain CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Base URL of the Kong admin API
    #[arg(long, env = "KONG_ADMIN_HOST", default_value = "http://127.0.0.1:8001")]
    kong_admin_host: String,

    /// Kubernetes API server URL; defaults to the ambient kubeconfig or
    /// in-cluster environment
    #[arg(long, env = "ORCHESTRATOR_HOST")]
    orchestrator_host: Option<String>,

    /// Cluster DNS suffix for upstream URLs
    #[arg(long, default_value = "cluster.local")]
    cluster_dns: String,

    /// Namespace this controller runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pod_namespace: String,

    /// Claim domains from ingress hostnames before routing them
    #[arg(long)]
    auto_claim: bool,

    /// Delete gateway APIs when a referencing service is deleted
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    wipe_on_delete: bool,

    /// Seconds before a Failed domain is re-admitted (0 disables)
    #[arg(long, default_value_t = 300)]
    resync_on_failed: u64,

    /// Requeue budget before an ingress is annotated dirty
    #[arg(long, default_value_t = 10)]
    max_retries: u32,

    /// Worker tasks per queue
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Domain::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let cfg = Config {
        kong_admin_host: cli.kong_admin_host,
        orchestrator_host: cli.orchestrator_host,
        cluster_dns: cli.cluster_dns,
        pod_namespace: cli.pod_namespace,
        auto_claim: cli.auto_claim,
        wipe_on_delete: cli.wipe_on_delete,
        resync_on_failed: Duration::from_secs(cli.resync_on_failed),
        max_retries: cli.max_retries,
        workers: cli.workers,
    };

    tracing::info!(
        kong = %cfg.kong_admin_host,
        auto_claim = cfg.auto_claim,
        workers = cfg.workers,
        "kong-ingress controller starting"
    );

    // Build the Kubernetes client, honoring the API server override.
    let mut kube_config = kube::Config::infer()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to infer Kubernetes config: {}", e))?;
    if let Some(host) = &cfg.orchestrator_host {
        kube_config.cluster_url = host
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid orchestrator host '{}': {}", host, e))?;
    }
    let client = Client::try_from(kube_config)
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let kong = Arc::new(RestKongAdmin::new(&cfg.kong_admin_host)?);
    let orchestrator = Arc::new(KubeOrchestrator::new(client.clone()));
    let identity = Arc::new(HttpIdentityProvider::new()?);
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "kong-controller"));

    let informers = Informers::new(client);
    let controller = KongController::new(
        cfg,
        informers.stores(),
        kong,
        orchestrator,
        identity,
        events,
    );

    // Cooperative shutdown on ctrl-c or SIGTERM.
    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
            _ = sigterm.recv() => tracing::info!("termination signal received"),
        }
        signal_stop.cancel();
    });

    controller.run(informers, stop).await?;

    tracing::info!("kong-ingress controller shut down");
    Ok(())
}
