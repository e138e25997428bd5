//! Controller configuration

use std::time::Duration;

/// Startup configuration for the controller.
///
/// Populated from CLI flags/environment in `main`; everything here is
/// immutable for the lifetime of the process.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base URL of the Kong admin API (e.g. `http://127.0.0.1:8001`)
    pub kong_admin_host: String,

    /// Kubernetes API server URL override; `None` uses the ambient
    /// kubeconfig / in-cluster environment
    pub orchestrator_host: Option<String>,

    /// Cluster DNS suffix used to build upstream URLs
    /// (`{svc}.{ns}.{cluster_dns}:{port}`)
    pub cluster_dns: String,

    /// Namespace the controller runs in
    pub pod_namespace: String,

    /// Claim domains from ingress hostnames before routing them
    pub auto_claim: bool,

    /// Delete gateway APIs during service garbage collection. When false the
    /// finalizer is still released and the records are left on the gateway.
    pub wipe_on_delete: bool,

    /// Re-enqueue domains in the `Failed` phase after this long; zero
    /// disables the resync
    pub resync_on_failed: Duration,

    /// Requeue budget after which an ingress is annotated dirty
    pub max_retries: u32,

    /// Worker tasks per queue
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kong_admin_host: "http://127.0.0.1:8001".to_string(),
            orchestrator_host: None,
            cluster_dns: "cluster.local".to_string(),
            pod_namespace: "default".to_string(),
            auto_claim: false,
            wipe_on_delete: true,
            resync_on_failed: Duration::from_secs(300),
            max_retries: 10,
            workers: 4,
        }
    }
}
