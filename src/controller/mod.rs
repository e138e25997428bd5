//! The reconciliation controller.
//!
//! Three informer caches feed three work queues; worker tasks drain the
//! queues through the sync procedures in the submodules. The controller
//! itself owns no state beyond the caches; Kubernetes and the gateway are
//! the sources of truth, and every sync converges toward them.

mod domain;
mod ingress;
mod service;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::reflector::Store;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crd::{Domain, DomainPhase};
use crate::events::EventPublisher;
use crate::identity::IdentityProvider;
use crate::informer::{object_key, Informer, InformerEvent};
use crate::kong::KongAdmin;
use crate::orchestrator::Orchestrator;
use crate::queue::TaskQueue;
use crate::{Error, Result};

/// Ingress class annotation; only matching ingresses are handled
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
/// Required ingress class value
pub const INGRESS_CLASS: &str = "kong";
/// Prefix of plugin configuration annotations (`kolihub.io/plugin-{name}`)
pub const PLUGIN_ANNOTATION_PREFIX: &str = "kolihub.io/plugin-";
/// Identity-provider host for JWT bootstrap
pub const JWT_PROVIDER_ANNOTATION: &str = "kolihub.io/x-jwt-auth0-domain";
/// Set by the controller when the retry budget is exhausted
pub const DIRTY_ANNOTATION: &str = "kolihub.io/dirty";
/// Strip the matched URI prefix before proxying (default true)
pub const STRIP_URI_ANNOTATION: &str = "ingress.kubernetes.io/strip-uri";
/// Forward the original Host header (default false)
pub const PRESERVE_HOST_ANNOTATION: &str = "ingress.kubernetes.io/preserve-host";

/// Pacing delay between items per worker
const PER_ITEM_DELAY: Duration = Duration::from_secs(1);

/// The three informer caches the reconciler reads.
pub struct Stores {
    /// Ingress cache
    pub ingresses: Store<Ingress>,
    /// Service cache
    pub services: Store<Service>,
    /// Domain cache
    pub domains: Store<Domain>,
}

/// The three informers feeding [`Stores`].
pub struct Informers {
    /// Ingress informer
    pub ingresses: Informer<Ingress>,
    /// Service informer
    pub services: Informer<Service>,
    /// Domain informer
    pub domains: Informer<Domain>,
}

impl Informers {
    /// Build cluster-wide informers for all three kinds.
    pub fn new(client: Client) -> Self {
        Self {
            ingresses: Informer::new(Api::all(client.clone())),
            services: Informer::new(Api::all(client.clone())),
            domains: Informer::new(Api::all(client)),
        }
    }

    /// The store handles for the reconciler.
    pub fn stores(&self) -> Stores {
        Stores {
            ingresses: self.ingresses.store(),
            services: self.services.store(),
            domains: self.domains.store(),
        }
    }
}

/// Watches the orchestrator and keeps the gateway configuration a function
/// of it.
pub struct KongController {
    pub(crate) cfg: Config,
    pub(crate) ingresses: Store<Ingress>,
    pub(crate) services: Store<Service>,
    pub(crate) domains: Store<Domain>,
    pub(crate) ing_queue: Arc<TaskQueue>,
    pub(crate) svc_queue: Arc<TaskQueue>,
    pub(crate) dom_queue: Arc<TaskQueue>,
    pub(crate) kong: Arc<dyn KongAdmin>,
    pub(crate) orchestrator: Arc<dyn Orchestrator>,
    pub(crate) identity: Arc<dyn IdentityProvider>,
    pub(crate) events: Arc<dyn EventPublisher>,
}

impl KongController {
    /// Wire up a controller over the given caches and collaborators.
    pub fn new(
        cfg: Config,
        stores: Stores,
        kong: Arc<dyn KongAdmin>,
        orchestrator: Arc<dyn Orchestrator>,
        identity: Arc<dyn IdentityProvider>,
        events: Arc<dyn EventPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            ingresses: stores.ingresses,
            services: stores.services,
            domains: stores.domains,
            ing_queue: TaskQueue::new("ingress"),
            svc_queue: TaskQueue::new("service"),
            dom_queue: TaskQueue::new("domain"),
            kong,
            orchestrator,
            identity,
            events,
        })
    }

    /// Run informers and workers until the stop token fires.
    ///
    /// Blocks until the ingress and service caches complete their initial
    /// list before starting any worker; a cache that can never sync is a
    /// fatal bootstrap error.
    pub async fn run(
        self: Arc<Self>,
        informers: Informers,
        stop: CancellationToken,
    ) -> Result<()> {
        info!("starting kong controller");
        let mut tasks = tokio::task::JoinSet::new();

        tasks.spawn(
            informers
                .ingresses
                .run(ingress_handler(Arc::clone(&self.ing_queue)), stop.clone()),
        );
        tasks.spawn(
            informers
                .services
                .run(service_handler(Arc::clone(&self.svc_queue)), stop.clone()),
        );
        tasks.spawn(informers.domains.run(
            domain_handler(
                Arc::clone(&self.dom_queue),
                self.cfg.resync_on_failed,
                stop.clone(),
            ),
            stop.clone(),
        ));

        self.ingresses
            .wait_until_ready()
            .await
            .map_err(|e| Error::informer(format!("ingress cache never synced: {e}")))?;
        self.services
            .wait_until_ready()
            .await
            .map_err(|e| Error::informer(format!("service cache never synced: {e}")))?;
        info!(workers = self.cfg.workers, "caches synced, starting workers");

        for _ in 0..self.cfg.workers {
            let ctrl = Arc::clone(&self);
            tasks.spawn(Arc::clone(&self.ing_queue).run(
                PER_ITEM_DELAY,
                move |key, requeues| {
                    let ctrl = Arc::clone(&ctrl);
                    async move { ctrl.sync_ingress(key, requeues).await }
                },
                stop.clone(),
            ));

            let ctrl = Arc::clone(&self);
            tasks.spawn(Arc::clone(&self.svc_queue).run(
                PER_ITEM_DELAY,
                move |key, requeues| {
                    let ctrl = Arc::clone(&ctrl);
                    async move { ctrl.sync_service(key, requeues).await }
                },
                stop.clone(),
            ));

            let ctrl = Arc::clone(&self);
            tasks.spawn(Arc::clone(&self.dom_queue).run(
                PER_ITEM_DELAY,
                move |key, requeues| {
                    let ctrl = Arc::clone(&ctrl);
                    async move { ctrl.sync_domain(key, requeues).await }
                },
                stop.clone(),
            ));
        }

        stop.cancelled().await;
        info!("shutting down kong controller");
        self.ing_queue.shutdown();
        self.svc_queue.shutdown();
        self.dom_queue.shutdown();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// True when the ingress is annotated for this controller.
pub(crate) fn is_kong_ingress(ing: &Ingress) -> bool {
    ing.annotations()
        .get(INGRESS_CLASS_ANNOTATION)
        .map(|class| class == INGRESS_CLASS)
        .unwrap_or(false)
}

/// True when the delivery carries a new resource version.
fn resource_changed<K: ResourceExt>(old: &K, new: &K) -> bool {
    old.resource_version() != new.resource_version()
}

/// Boolean annotation with a default; malformed values fall back with a log.
pub(crate) fn bool_annotation(ing: &Ingress, key: &str, default: bool) -> bool {
    match ing.annotations().get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(
                annotation = key,
                value = %raw,
                default,
                "failed to parse boolean annotation, using default"
            );
            default
        }),
    }
}

/// Subscription for the ingress informer: class-filtered, update-gated on
/// resource version.
pub(crate) fn ingress_handler(
    queue: Arc<TaskQueue>,
) -> impl Fn(InformerEvent<Ingress>) + Send + Sync + 'static {
    move |event| match event {
        InformerEvent::Add(ing) | InformerEvent::Delete(ing) => {
            if !is_kong_ingress(&ing) {
                debug!(
                    ingress = %object_key(&ing),
                    "ignoring ingress without {INGRESS_CLASS_ANNOTATION}={INGRESS_CLASS}"
                );
                return;
            }
            queue.add(object_key(&ing));
        }
        InformerEvent::Update { old, new } => {
            if resource_changed(old.as_ref(), &new) && is_kong_ingress(&new) {
                queue.add(object_key(&new));
            }
        }
    }
}

/// Subscription for the service informer.
pub(crate) fn service_handler(
    queue: Arc<TaskQueue>,
) -> impl Fn(InformerEvent<Service>) + Send + Sync + 'static {
    move |event| match event {
        InformerEvent::Add(svc) | InformerEvent::Delete(svc) => queue.add(object_key(&svc)),
        InformerEvent::Update { old, new } => {
            if resource_changed(old.as_ref(), &new) {
                queue.add(object_key(&new));
            }
        }
    }
}

/// Subscription for the domain informer. Failed domains are re-enqueued
/// after `resync_on_failed` so rejected claims get another admission pass.
pub(crate) fn domain_handler(
    queue: Arc<TaskQueue>,
    resync_on_failed: Duration,
    stop: CancellationToken,
) -> impl Fn(InformerEvent<Domain>) + Send + Sync + 'static {
    move |event| match event {
        InformerEvent::Add(dom) | InformerEvent::Delete(dom) => queue.add(object_key(&dom)),
        InformerEvent::Update { old, new } => {
            if !resource_changed(old.as_ref(), &new) {
                return;
            }
            let failed = new
                .status
                .as_ref()
                .map(|s| s.phase == DomainPhase::Failed)
                .unwrap_or(false);
            if failed && !resync_on_failed.is_zero() {
                queue.add_after(object_key(&new), resync_on_failed, stop.clone());
            } else {
                queue.add(object_key(&new));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests {
    use super::testutil::{annotated_ingress, ingress, service};
    use super::*;

    #[test]
    fn class_filter_requires_kong() {
        let ing = ingress("app", "web", "api.example.com", "/v1", "svc1", 80);
        assert!(is_kong_ingress(&ing), "fixture carries the class annotation");

        let other = annotated_ingress("app", "web", &[(INGRESS_CLASS_ANNOTATION, "nginx")]);
        assert!(!is_kong_ingress(&other));

        let bare = annotated_ingress("app", "web", &[]);
        assert!(!is_kong_ingress(&bare));
    }

    #[test]
    fn bool_annotations_fall_back_to_defaults() {
        let ing = annotated_ingress(
            "app",
            "web",
            &[
                (STRIP_URI_ANNOTATION, "false"),
                (PRESERVE_HOST_ANNOTATION, "not-a-bool"),
            ],
        );
        assert!(!bool_annotation(&ing, STRIP_URI_ANNOTATION, true));
        assert!(!bool_annotation(&ing, PRESERVE_HOST_ANNOTATION, false));
        // Missing annotation takes the default.
        assert!(bool_annotation(&ing, "ingress.kubernetes.io/nope", true));
        // Malformed value takes the default too.
        let malformed = annotated_ingress("app", "web", &[(STRIP_URI_ANNOTATION, "yes please")]);
        assert!(bool_annotation(&malformed, STRIP_URI_ANNOTATION, true));
        // So does the empty string.
        let empty = annotated_ingress("app", "web", &[(STRIP_URI_ANNOTATION, "")]);
        assert!(bool_annotation(&empty, STRIP_URI_ANNOTATION, true));
    }

    #[test]
    fn ingress_handler_filters_class_and_resource_version() {
        let queue = TaskQueue::new("test");
        let handler = ingress_handler(Arc::clone(&queue));

        // Foreign class: ignored on add.
        handler(InformerEvent::Add(annotated_ingress(
            "app",
            "other",
            &[(INGRESS_CLASS_ANNOTATION, "nginx")],
        )));
        assert!(queue.is_empty());

        // Matching class enqueues.
        handler(InformerEvent::Add(ingress(
            "app", "web", "api.example.com", "/", "svc1", 80,
        )));
        assert_eq!(queue.len(), 1);

        // Update with unchanged resource version is dropped.
        let mut old = ingress("app", "web2", "api.example.com", "/", "svc1", 80);
        old.metadata.resource_version = Some("1".to_string());
        let unchanged = old.clone();
        handler(InformerEvent::Update {
            old: Arc::new(old.clone()),
            new: unchanged,
        });
        assert_eq!(queue.len(), 1);

        // Update with a new resource version enqueues.
        let mut newer = old.clone();
        newer.metadata.resource_version = Some("2".to_string());
        handler(InformerEvent::Update {
            old: Arc::new(old),
            new: newer,
        });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn service_handler_enqueues_adds_and_changed_updates() {
        let queue = TaskQueue::new("test");
        let handler = service_handler(Arc::clone(&queue));

        handler(InformerEvent::Add(service("app", "svc1", &[80])));
        assert_eq!(queue.len(), 1);

        let mut old = service("app", "svc2", &[80]);
        old.metadata.resource_version = Some("5".to_string());
        handler(InformerEvent::Update {
            old: Arc::new(old.clone()),
            new: old.clone(),
        });
        assert_eq!(queue.len(), 1, "same resource version is dropped");

        let mut newer = old.clone();
        newer.metadata.resource_version = Some("6".to_string());
        handler(InformerEvent::Update {
            old: Arc::new(old),
            new: newer,
        });
        assert_eq!(queue.len(), 2);
    }
}
