//! Service garbage collection.
//!
//! Gateway APIs are keyed by upstream URL, so a deleted service's records
//! are found by listing per port. The cleanup finalizer keeps the service
//! alive until every record is gone; releasing it is the last step.

use kube::runtime::reflector::ObjectRef;
use tracing::{debug, instrument};

use super::KongController;
use crate::informer::split_key;
use crate::kong::naming::upstream_url;
use crate::{Error, Result};

impl KongController {
    /// Garbage-collect gateway records for a service being deleted.
    #[instrument(skip(self), fields(key = %key))]
    pub(crate) async fn sync_service(&self, key: String, _num_requeues: u32) -> Result<()> {
        let (ns, name) = split_key(&key);
        let Some(ns) = ns else {
            return Err(Error::validation(format!(
                "service key '{key}' has no namespace"
            )));
        };
        let Some(svc) = self.services.get(&ObjectRef::new(name).within(ns)) else {
            debug!("service resource no longer exists");
            return Ok(());
        };
        if svc.metadata.deletion_timestamp.is_none() {
            return Ok(());
        }

        let ports = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.clone())
            .unwrap_or_default();
        for port in &ports {
            let upstream = upstream_url(&self.cfg.cluster_dns, ns, name, port.port);
            if !self.cfg.wipe_on_delete {
                debug!(upstream = %upstream, "wipe-on-delete disabled, leaving gateway records");
                continue;
            }
            debug!(upstream = %upstream, "cleaning up gateway apis for upstream");
            let apis = self
                .kong
                .list_apis_by_upstream(&upstream)
                .await
                .map_err(|err| Error::gateway(format!("failed listing apis: {err}")))?;
            for api in apis {
                debug!(api = %api.name, uid = ?api.uid, "removing gateway api");
                self.kong.delete_api(&api.name).await?;
            }
        }

        // Everything referencing this service is gone; let it go.
        self.orchestrator.clear_service_finalizers(ns, name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testutil::*;
    use super::super::{KongController, Stores};
    use crate::config::Config;
    use crate::identity::MockIdentityProvider;
    use crate::kong::client::MockKongAdmin;
    use crate::orchestrator::MockOrchestrator;
    use crate::Error;

    struct Harness {
        kong: MockKongAdmin,
        orchestrator: MockOrchestrator,
        stores: Stores,
        writers: TestWriters,
        cfg: Config,
    }

    impl Harness {
        fn new() -> Self {
            let (stores, writers) = stores();
            Self {
                kong: MockKongAdmin::new(),
                orchestrator: MockOrchestrator::new(),
                stores,
                writers,
                cfg: Config::default(),
            }
        }

        fn controller(self) -> Arc<KongController> {
            KongController::new(
                self.cfg,
                self.stores,
                arc(self.kong),
                arc(self.orchestrator),
                arc(MockIdentityProvider::new()),
                arc(RecordingEvents::default()),
            )
        }
    }

    #[tokio::test]
    async fn deletion_gc_removes_apis_and_releases_finalizer() {
        let mut h = Harness::new();
        h.writers
            .apply_service(deleting_service("app", "svc1", &[80, 443]));

        h.kong
            .expect_list_apis_by_upstream()
            .withf(|upstream| upstream == "http://svc1.app.cluster.local:80")
            .returning(|upstream| {
                Ok(vec![stored_api(
                    "api.example.com~app~28115159",
                    "u-1",
                    upstream,
                )])
            });
        h.kong
            .expect_list_apis_by_upstream()
            .withf(|upstream| upstream == "https://svc1.app.cluster.local:443")
            .returning(|_| Ok(Vec::new()));
        h.kong
            .expect_delete_api()
            .withf(|name| name == "api.example.com~app~28115159")
            .times(1)
            .returning(|_| Ok(()));
        h.orchestrator
            .expect_clear_service_finalizers()
            .withf(|ns, name| ns == "app" && name == "svc1")
            .times(1)
            .returning(|_, _| Ok(()));

        let ctrl = h.controller();
        ctrl.sync_service("app/svc1".to_string(), 0).await.unwrap();
    }

    #[tokio::test]
    async fn live_service_is_left_alone() {
        let mut h = Harness::new();
        h.writers.apply_service(service("app", "svc1", &[80]));
        // No expectations: nothing may be called for a live service.

        let ctrl = h.controller();
        ctrl.sync_service("app/svc1".to_string(), 0).await.unwrap();
    }

    #[tokio::test]
    async fn missing_service_is_success() {
        let h = Harness::new();
        let ctrl = h.controller();
        ctrl.sync_service("app/gone".to_string(), 0).await.unwrap();
    }

    #[tokio::test]
    async fn wipe_on_delete_off_only_releases_the_finalizer() {
        let mut h = Harness::new();
        h.cfg.wipe_on_delete = false;
        h.writers
            .apply_service(deleting_service("app", "svc1", &[80]));

        // No gateway expectations: records stay put.
        h.orchestrator
            .expect_clear_service_finalizers()
            .times(1)
            .returning(|_, _| Ok(()));

        let ctrl = h.controller();
        ctrl.sync_service("app/svc1".to_string(), 0).await.unwrap();
    }

    #[tokio::test]
    async fn listing_failure_keeps_the_finalizer() {
        let mut h = Harness::new();
        h.writers
            .apply_service(deleting_service("app", "svc1", &[80]));

        h.kong
            .expect_list_apis_by_upstream()
            .returning(|_| Err(Error::gateway("kong is down")));
        // clear_service_finalizers must not run.

        let ctrl = h.controller();
        let err = ctrl.sync_service("app/svc1".to_string(), 0).await.unwrap_err();
        assert!(matches!(err, Error::Gateway { .. }));
    }

    #[tokio::test]
    async fn delete_failure_aborts_and_requeues() {
        let mut h = Harness::new();
        h.writers
            .apply_service(deleting_service("app", "svc1", &[80]));

        h.kong.expect_list_apis_by_upstream().returning(|upstream| {
            Ok(vec![stored_api(
                "api.example.com~app~28115159",
                "u-1",
                upstream,
            )])
        });
        h.kong
            .expect_delete_api()
            .returning(|_| Err(Error::gateway("delete failed")));

        let ctrl = h.controller();
        assert!(ctrl.sync_service("app/svc1".to_string(), 0).await.is_err());
    }
}
