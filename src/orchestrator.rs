//! Kubernetes-side mutations.
//!
//! The reconciler only ever patches metadata (finalizers, annotations),
//! reads TLS secrets and writes Domain claims; that whole surface sits
//! behind [`Orchestrator`] so reconciliation logic can be tested against a
//! mock.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::controller::DIRTY_ANNOTATION;
use crate::crd::{Domain, DomainStatus};
use crate::kong::FINALIZER;
use crate::Result;

/// Orchestrator operations the reconciler performs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Add the cleanup finalizer to a service (strategic merge; idempotent).
    async fn add_service_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove every finalizer from a service, releasing its deletion.
    async fn clear_service_finalizers(&self, namespace: &str, name: &str) -> Result<()>;

    /// Mark an ingress as unable to recover on its own.
    async fn set_ingress_dirty(&self, namespace: &str, name: &str) -> Result<()>;

    /// Read a TLS secret. Wrong types and missing secrets are the caller's
    /// problem; this returns whatever the API server says.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Create a new Domain claim.
    async fn create_domain(&self, domain: &Domain) -> Result<()>;

    /// Replace an existing Domain claim.
    async fn update_domain(&self, domain: &Domain) -> Result<()>;

    /// Merge-patch a Domain's status subresource.
    async fn patch_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<()>;
}

/// Production implementation over a `kube::Client`.
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    /// Wrap a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn add_service_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Strategic(json!({"metadata": {"finalizers": [FINALIZER]}})),
        )
        .await?;
        Ok(())
    }

    async fn clear_service_finalizers(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({"metadata": {"finalizers": []}})),
        )
        .await?;
        Ok(())
    }

    async fn set_ingress_dirty(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Strategic(json!({"metadata": {"annotations": {(DIRTY_ANNOTATION): "true"}}})),
        )
        .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn create_domain(&self, domain: &Domain) -> Result<()> {
        let namespace = domain.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<Domain> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), domain).await?;
        Ok(())
    }

    async fn update_domain(&self, domain: &Domain) -> Result<()> {
        let namespace = domain.metadata.namespace.as_deref().unwrap_or_default();
        let name = domain.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Domain> = Api::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), domain).await?;
        Ok(())
    }

    async fn patch_domain_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DomainStatus,
    ) -> Result<()> {
        let api: Api<Domain> = Api::namespaced(self.client.clone(), namespace);
        api.patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({"status": status})),
        )
        .await?;
        Ok(())
    }
}
