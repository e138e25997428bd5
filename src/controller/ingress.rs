//! Ingress reconciliation.
//!
//! Each rule path becomes one gateway API record named by
//! `(host, namespace, path)`; the referenced service gets the cleanup
//! finalizer so deletion can garbage-collect those records later. The whole
//! pass is idempotent: every step converges, so a failure partway leaves
//! only work the next requeue will redo.

use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::{
    bool_annotation, KongController, DIRTY_ANNOTATION, JWT_PROVIDER_ANNOTATION,
    PLUGIN_ANNOTATION_PREFIX, PRESERVE_HOST_ANNOTATION, STRIP_URI_ANNOTATION,
};
use crate::identity::{issuer_key, public_key_pem};
use crate::informer::split_key;
use crate::kong::naming::{api_name, normalize_path, upstream_url};
use crate::kong::types::JwtCredential;
use crate::kong::{Certificate, KongApi, PluginConfig};
use crate::{Error, Result};

/// Secret type required for TLS uploads
const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

impl KongController {
    /// Converge the gateway onto one ingress.
    #[instrument(skip(self), fields(key = %key))]
    pub(crate) async fn sync_ingress(&self, key: String, num_requeues: u32) -> Result<()> {
        let (ns, name) = split_key(&key);
        let Some(ns) = ns else {
            return Err(Error::validation(format!(
                "ingress key '{key}' has no namespace"
            )));
        };
        let Some(ing) = self.ingresses.get(&ObjectRef::new(name).within(ns)) else {
            debug!("ingress no longer exists");
            return Ok(());
        };

        if num_requeues > self.cfg.max_retries {
            // Dirty only signals that the object could not recover by
            // itself; the sync keeps going (and keeps being requeued).
            self.set_dirty(&ing, num_requeues).await;
        }

        if self.cfg.auto_claim {
            self.claim_domains(&ing).await?;
            let (allowed, unclaimed) = self.is_claimed(&ing);
            if !allowed {
                if num_requeues > 2 {
                    self.events
                        .warn(
                            &ing.object_ref(&()),
                            "DomainNotFound",
                            format!("The domain '{unclaimed}' was not claimed, check its state"),
                        )
                        .await;
                }
                return Err(Error::validation(format!(
                    "domain '{unclaimed}' is not claimed"
                )));
            }
        }

        let rules = ing
            .spec
            .as_ref()
            .and_then(|spec| spec.rules.as_ref())
            .cloned()
            .unwrap_or_default();
        for rule in &rules {
            let Some(http) = &rule.http else {
                debug!("rule has no http section, skipping");
                continue;
            };
            let host = rule.host.as_deref().unwrap_or_default();
            for path in &http.paths {
                self.sync_route(&ing, ns, host, path).await?;
            }
        }
        Ok(())
    }

    /// Converge one `(host, path) -> backend` route.
    async fn sync_route(
        &self,
        ing: &Ingress,
        namespace: &str,
        host: &str,
        path: &HTTPIngressPath,
    ) -> Result<()> {
        let backend = path.backend.service.as_ref().ok_or_else(|| {
            Error::validation("ingress path backend does not reference a service")
        })?;
        let Some(port) = backend.port.as_ref().and_then(|p| p.number) else {
            self.events
                .warn(
                    &ing.object_ref(&()),
                    "FailedAddRoute",
                    format!(
                        "Backend port for service '{}' must be numeric",
                        backend.name
                    ),
                )
                .await;
            return Err(Error::validation(format!(
                "backend port for service '{}' must be numeric",
                backend.name
            )));
        };

        let service_exists = self.services.state().iter().any(|svc| {
            svc.name_any() == backend.name && svc.namespace().as_deref() == Some(namespace)
        });
        if !service_exists {
            self.events
                .warn(
                    &ing.object_ref(&()),
                    "ServiceNotFound",
                    format!("Service '{}' not found for ingress", backend.name),
                )
                .await;
            return Err(Error::validation(format!(
                "service '{}' not found",
                backend.name
            )));
        }

        // The finalizer ties the service's lifetime to the gateway records
        // derived from it; garbage collection runs before it is released.
        self.orchestrator
            .add_service_finalizer(namespace, &backend.name)
            .await?;

        let upstream = upstream_url(&self.cfg.cluster_dns, namespace, &backend.name, port);
        let raw_path = path.path.as_deref().unwrap_or_default();
        let name = api_name(host, namespace, raw_path);

        let existing = match self.kong.get_api(&name).await {
            Ok(existing) => existing,
            Err(err) => {
                self.events
                    .warn(
                        &ing.object_ref(&()),
                        "FailedAddRoute",
                        format!("{err}"),
                    )
                    .await;
                return Err(err);
            }
        };

        let mut desired = KongApi {
            name: name.clone(),
            uid: None,
            created_at: None,
            upstream_url: upstream,
            hosts: if host.is_empty() {
                Vec::new()
            } else {
                vec![host.to_string()]
            },
            uris: if raw_path.is_empty() {
                Vec::new()
            } else {
                vec![normalize_path(raw_path).to_string()]
            },
            strip_uri: bool_annotation(ing, STRIP_URI_ANNOTATION, true),
            preserve_host: bool_annotation(ing, PRESERVE_HOST_ANNOTATION, false),
        };
        if let Some(existing) = existing {
            // Carrying the UID turns the upsert into an in-place update.
            desired.uid = existing.uid;
            desired.created_at = existing.created_at;
        }

        let api = match self.kong.upsert_api(&desired).await {
            Ok(api) => api,
            Err(err) if err.is_conflict() => {
                // Another worker got there first; the record it wrote is the
                // same function of the ingress, so adopt it.
                debug!(api = %name, "conflict on upsert, adopting concurrent record");
                self.kong
                    .get_api(&name)
                    .await?
                    .ok_or_else(|| Error::gateway(format!("api '{name}' vanished after conflict")))?
            }
            Err(err) => return Err(err),
        };
        let uid = api
            .uid
            .ok_or_else(|| Error::gateway(format!("gateway returned api '{name}' without id")))?;
        info!(host, api = %name, uid = %uid, "route configured");

        self.configure_plugins(&uid, ing).await?;
        self.configure_certificates(ing, namespace).await?;
        self.configure_jwt_auth(ing).await?;
        Ok(())
    }

    /// Attach every `kolihub.io/plugin-{name}` annotation to the API.
    ///
    /// An already-attached plugin is left alone even when the annotation
    /// value changed; updating requires delete-then-create by the operator.
    pub(crate) async fn configure_plugins(&self, api_uid: &str, ing: &Ingress) -> Result<()> {
        for (annotation, value) in ing.annotations() {
            let Some(plugin_name) = annotation.strip_prefix(PLUGIN_ANNOTATION_PREFIX) else {
                continue;
            };
            let config = match PluginConfig::decode(plugin_name, value) {
                Ok(config) => config,
                Err(err) => {
                    self.events
                        .warn(
                            &ing.object_ref(&()),
                            "FailedAddRoute",
                            format!("Invalid plugin annotation '{annotation}': {err}"),
                        )
                        .await;
                    return Err(err);
                }
            };

            let existing = self.kong.list_plugins(api_uid).await?;
            if existing.iter().any(|p| p.name == config.name()) {
                info!(
                    plugin = config.name(),
                    api = api_uid,
                    "plugin already configured; new configuration is not applied"
                );
                continue;
            }
            self.kong
                .create_plugin(api_uid, &config.to_plugin()?)
                .await?;
            info!(plugin = config.name(), api = api_uid, "plugin created");
        }
        Ok(())
    }

    /// Upload every TLS certificate declared on the ingress, one per host.
    ///
    /// Runs unconditionally on each reconcile; the gateway tolerates the
    /// duplicates.
    pub(crate) async fn configure_certificates(
        &self,
        ing: &Ingress,
        namespace: &str,
    ) -> Result<()> {
        let tls = ing
            .spec
            .as_ref()
            .and_then(|spec| spec.tls.as_ref())
            .cloned()
            .unwrap_or_default();
        for binding in &tls {
            let Some(secret_name) = binding.secret_name.as_deref() else {
                continue;
            };
            for host in binding.hosts.as_deref().unwrap_or_default() {
                let secret = self.orchestrator.get_secret(namespace, secret_name).await?;
                if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
                    let found = secret.type_.unwrap_or_default();
                    self.events
                        .warn(
                            &ing.object_ref(&()),
                            "FailedAddRoute",
                            format!(
                                "Secret '{secret_name}' is not a TLS secret (found '{found}')"
                            ),
                        )
                        .await;
                    return Err(Error::validation(format!(
                        "secret '{secret_name}' is not a TLS secret (found '{found}')"
                    )));
                }
                let data = secret.data.unwrap_or_default();
                let field = |key: &str| {
                    data.get(key)
                        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
                        .ok_or_else(|| {
                            Error::validation(format!("secret '{secret_name}' has no '{key}'"))
                        })
                };
                let certificate = Certificate {
                    cert: field("tls.crt")?,
                    key: field("tls.key")?,
                    snis: vec![host.clone()],
                };
                self.kong.create_certificate(&certificate).await?;
                debug!(host = %host, secret = secret_name, "certificate uploaded");
            }
        }
        Ok(())
    }

    /// Bootstrap the JWT consumer for the annotated identity provider.
    pub(crate) async fn configure_jwt_auth(&self, ing: &Ingress) -> Result<()> {
        let Some(host) = ing.annotations().get(JWT_PROVIDER_ANNOTATION) else {
            return Ok(());
        };

        let cert_pem = self.identity.fetch_certificate_pem(host).await?;
        let rsa_public_key = public_key_pem(&cert_pem)?;

        if self.kong.get_consumer(host).await?.is_none() {
            self.kong.create_consumer(host).await?;
            info!(consumer = %host, "jwt consumer created");
        }

        let credentials = self.kong.list_jwt_credentials(host).await?;
        if credentials.is_empty() {
            let credential = JwtCredential {
                id: None,
                algorithm: "RS256".to_string(),
                rsa_public_key: Some(rsa_public_key),
                key: issuer_key(host),
            };
            self.kong.create_jwt_credential(host, &credential).await?;
            info!(consumer = %host, "jwt credential created");
        }
        Ok(())
    }

    /// Best-effort: mark the ingress as unable to recover from itself.
    async fn set_dirty(&self, ing: &Ingress, retries: u32) {
        if ing.annotations().get(DIRTY_ANNOTATION).map(String::as_str) == Some("true") {
            return;
        }
        let namespace = ing.namespace().unwrap_or_default();
        let name = ing.name_any();
        info!(
            retries,
            "retry budget exhausted, marking ingress as dirty"
        );
        if let Err(err) = self.orchestrator.set_ingress_dirty(&namespace, &name).await {
            warn!(error = %err, "failed to set resource as dirty");
        }
    }
}
