//! Domain claims.
//!
//! A hostname may only be routed once a Domain claim for it reaches `OK`.
//! `claim_domains`/`is_claimed` run inside the ingress sync when auto-claim
//! is on; `sync_domain` is the admission side, driving the phase machine
//! `New -> OK | Failed` with first-claim-wins across namespaces.

use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use super::KongController;
use crate::crd::{is_valid_domain, resource_name, Domain, DomainPhase, DomainStatus};
use crate::informer::split_key;
use crate::{Error, Result};

impl KongController {
    /// Create or update Domain claims for every hostname on the ingress.
    pub(crate) async fn claim_domains(&self, ing: &Ingress) -> Result<()> {
        let namespace = ing.namespace().unwrap_or_default();
        for host in hosts_from_ingress(ing) {
            if !is_valid_domain(&host) {
                return Err(Error::validation(format!(
                    "'{host}' is not a valid domain"
                )));
            }
            let desired = Domain::from_host(&namespace, &host);
            let name = resource_name(&host);
            match self.domains.get(&ObjectRef::new(&name).within(&namespace)) {
                Some(existing) if existing.spec == desired.spec => {
                    debug!(domain = %host, "claim unchanged, skipping");
                }
                Some(existing) => {
                    info!(domain = %host, "updating claim");
                    let mut updated = (*existing).clone();
                    updated.spec = desired.spec.clone();
                    if !existing.is_claimed() {
                        // A failed claim gets another admission pass when
                        // its spec changes.
                        updated.status = Some(DomainStatus::new_phase());
                    }
                    self.orchestrator.update_domain(&updated).await?;
                }
                None => {
                    info!(domain = %host, "creating claim");
                    self.orchestrator.create_domain(&desired).await?;
                }
            }
        }
        Ok(())
    }

    /// Check every rule host against the claims in the ingress's namespace.
    ///
    /// Returns `(allowed, first_unclaimed_host)`; the host string is empty
    /// when everything is claimed.
    pub(crate) fn is_claimed(&self, ing: &Ingress) -> (bool, String) {
        let namespace = ing.namespace().unwrap_or_default();
        let rules = ing
            .spec
            .as_ref()
            .and_then(|spec| spec.rules.as_ref())
            .cloned()
            .unwrap_or_default();
        for rule in &rules {
            let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) else {
                continue;
            };
            let claimed = self.domains.state().iter().any(|dom| {
                dom.namespace().as_deref() == Some(namespace.as_str())
                    && dom.is_claimed()
                    && dom.domain() == host
            });
            if !claimed {
                return (false, host.to_string());
            }
            debug!(domain = %host, "found claimed domain");
        }
        (true, String::new())
    }

    /// Drive one Domain claim through admission.
    #[instrument(skip(self), fields(key = %key))]
    pub(crate) async fn sync_domain(&self, key: String, _num_requeues: u32) -> Result<()> {
        let (ns, name) = split_key(&key);
        let Some(ns) = ns else {
            return Err(Error::validation(format!(
                "domain key '{key}' has no namespace"
            )));
        };
        let Some(dom) = self.domains.get(&ObjectRef::new(name).within(ns)) else {
            debug!("domain no longer exists");
            return Ok(());
        };

        let phase = dom.status.as_ref().map(|s| s.phase).unwrap_or_default();
        match phase {
            DomainPhase::OK => Ok(()),
            DomainPhase::Failed => {
                // Terminal here; the update handler re-enqueues after the
                // resync window and claim_domains resets on spec changes.
                debug!("domain is failed, waiting for resync or a spec change");
                Ok(())
            }
            DomainPhase::New => {
                let status = self.admit(&dom);
                info!(domain = %dom.domain(), phase = ?status.phase, "domain admission");
                self.orchestrator
                    .patch_domain_status(ns, name, &status)
                    .await?;
                Ok(())
            }
        }
    }

    /// Admission decision for a `New` claim.
    fn admit(&self, dom: &Domain) -> DomainStatus {
        if !is_valid_domain(dom.domain()) {
            return DomainStatus::failed(format!("'{}' is not a valid domain", dom.domain()));
        }
        let taken = self.domains.state().iter().any(|other| {
            other.domain() == dom.domain()
                && other.namespace() != dom.namespace()
                && other.is_claimed()
        });
        if taken {
            return DomainStatus::failed(format!(
                "domain '{}' is already claimed by another namespace",
                dom.domain()
            ));
        }
        DomainStatus::ok()
    }
}

/// Unique, non-empty rule hosts of an ingress, in rule order.
pub(crate) fn hosts_from_ingress(ing: &Ingress) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    if let Some(rules) = ing.spec.as_ref().and_then(|spec| spec.rules.as_ref()) {
        for rule in rules {
            if let Some(host) = rule.host.as_deref().filter(|h| !h.is_empty()) {
                if !hosts.iter().any(|h| h == host) {
                    hosts.push(host.to_string());
                }
            }
        }
    }
    hosts
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testutil::*;
    use super::super::{KongController, Stores};
    use super::hosts_from_ingress;
    use crate::config::Config;
    use crate::crd::{Domain, DomainPhase, DomainStatus, DomainType};
    use crate::identity::MockIdentityProvider;
    use crate::kong::client::MockKongAdmin;
    use crate::orchestrator::MockOrchestrator;

    struct Harness {
        orchestrator: MockOrchestrator,
        stores: Stores,
        writers: TestWriters,
        cfg: Config,
    }

    impl Harness {
        fn new() -> Self {
            let (stores, writers) = stores();
            Self {
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
                arc(MockKongAdmin::new()),
                arc(self.orchestrator),
                arc(MockIdentityProvider::new()),
                arc(RecordingEvents::default()),
            )
        }
    }

    #[tokio::test]
    async fn claim_creates_missing_domains() {
        let mut h = Harness::new();
        h.orchestrator
            .expect_create_domain()
            .withf(|dom: &Domain| {
                dom.spec.domain == "api.example.com"
                    && dom.spec.domain_type == DomainType::Primary
                    && dom.metadata.namespace.as_deref() == Some("app")
            })
            .times(1)
            .returning(|_| Ok(()));

        let ing = ingress("app", "web", "api.example.com", "/v1", "svc1", 80);
        let ctrl = h.controller();
        ctrl.claim_domains(&ing).await.unwrap();
    }

    #[tokio::test]
    async fn claim_skips_deep_equal_specs() {
        let mut h = Harness::new();
        let mut existing = Domain::from_host("app", "api.example.com");
        existing.status = Some(DomainStatus::ok());
        h.writers.apply_domain(existing);
        // No orchestrator expectations: an unchanged spec is a no-op.

        let ing = ingress("app", "web", "api.example.com", "/v1", "svc1", 80);
        let ctrl = h.controller();
        ctrl.claim_domains(&ing).await.unwrap();
    }

    #[tokio::test]
    async fn claim_updates_changed_spec_and_resets_failed_status() {
        let mut h = Harness::new();
        // Same object name, but the recorded spec diverged (claimed as a
        // wildcard once upon a time) and the claim never went OK.
        let mut existing = Domain::from_host("app", "api.example.com");
        existing.spec.domain_type = DomainType::Wildcard;
        existing.status = Some(DomainStatus::failed("mismatch"));
        h.writers.apply_domain(existing);

        h.orchestrator
            .expect_update_domain()
            .withf(|dom: &Domain| {
                dom.spec.domain_type == DomainType::Primary
                    && dom.status.as_ref().map(|s| s.phase) == Some(DomainPhase::New)
            })
            .times(1)
            .returning(|_| Ok(()));

        let ing = ingress("app", "web", "api.example.com", "/v1", "svc1", 80);
        let ctrl = h.controller();
        ctrl.claim_domains(&ing).await.unwrap();
    }

    #[tokio::test]
    async fn claim_keeps_ok_status_on_spec_update() {
        let mut h = Harness::new();
        let mut existing = Domain::from_host("app", "api.example.com");
        existing.spec.domain_type = DomainType::Wildcard;
        existing.status = Some(DomainStatus::ok());
        h.writers.apply_domain(existing);

        h.orchestrator
            .expect_update_domain()
            .withf(|dom: &Domain| {
                dom.status.as_ref().map(|s| s.phase) == Some(DomainPhase::OK)
            })
            .times(1)
            .returning(|_| Ok(()));

        let ing = ingress("app", "web", "api.example.com", "/v1", "svc1", 80);
        let ctrl = h.controller();
        ctrl.claim_domains(&ing).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_hostname_fails_the_claim() {
        let h = Harness::new();
        let ing = ingress("app", "web", "not_a_domain", "/v1", "svc1", 80);
        let ctrl = h.controller();
        assert!(ctrl.claim_domains(&ing).await.is_err());
    }

    #[tokio::test]
    async fn is_claimed_requires_ok_phase_in_the_same_namespace() {
        let mut h = Harness::new();
        h.writers.apply_domain(claimed_domain("app", "api.example.com"));
        // Claimed in another namespace does not help 'other'.
        let ctrl = h.controller();

        let allowed = ingress("app", "web", "api.example.com", "/v1", "svc1", 80);
        assert_eq!(ctrl.is_claimed(&allowed), (true, String::new()));

        let foreign = ingress("other", "web", "api.example.com", "/v1", "svc1", 80);
        let (ok, host) = ctrl.is_claimed(&foreign);
        assert!(!ok);
        assert_eq!(host, "api.example.com");
    }

    #[tokio::test]
    async fn is_claimed_rejects_unadmitted_phases() {
        let mut h = Harness::new();
        let mut dom = Domain::from_host("app", "api.example.com");
        dom.status = Some(DomainStatus::new_phase());
        h.writers.apply_domain(dom);

        let ctrl = h.controller();
        let ing = ingress("app", "web", "api.example.com", "/v1", "svc1", 80);
        let (ok, host) = ctrl.is_claimed(&ing);
        assert!(!ok);
        assert_eq!(host, "api.example.com");
    }

    #[tokio::test]
    async fn sync_admits_a_valid_new_domain() {
        let mut h = Harness::new();
        let mut dom = Domain::from_host("app", "api.example.com");
        dom.status = Some(DomainStatus::new_phase());
        h.writers.apply_domain(dom);

        h.orchestrator
            .expect_patch_domain_status()
            .withf(|ns, name, status| {
                ns == "app" && name == "api.example.com" && status.phase == DomainPhase::OK
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctrl = h.controller();
        ctrl.sync_domain("app/api.example.com".to_string(), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sync_fails_a_domain_claimed_elsewhere() {
        let mut h = Harness::new();
        h.writers
            .apply_domain(claimed_domain("other", "api.example.com"));
        let mut dom = Domain::from_host("app", "api.example.com");
        dom.status = Some(DomainStatus::new_phase());
        h.writers.apply_domain(dom);

        h.orchestrator
            .expect_patch_domain_status()
            .withf(|ns, _, status| {
                ns == "app"
                    && status.phase == DomainPhase::Failed
                    && status
                        .message
                        .as_deref()
                        .unwrap_or_default()
                        .contains("already claimed")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctrl = h.controller();
        ctrl.sync_domain("app/api.example.com".to_string(), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sync_fails_an_invalid_domain() {
        let mut h = Harness::new();
        let mut dom = Domain::from_host("app", "bad_host");
        dom.status = Some(DomainStatus::new_phase());
        h.writers.apply_domain(dom);

        h.orchestrator
            .expect_patch_domain_status()
            .withf(|_, _, status| status.phase == DomainPhase::Failed)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctrl = h.controller();
        ctrl.sync_domain("app/bad_host".to_string(), 0).await.unwrap();
    }

    #[tokio::test]
    async fn sync_leaves_ok_and_failed_domains_alone() {
        let mut h = Harness::new();
        h.writers.apply_domain(claimed_domain("app", "ok.example.com"));
        let mut failed = Domain::from_host("app", "failed.example.com");
        failed.status = Some(DomainStatus::failed("taken"));
        h.writers.apply_domain(failed);
        // No patch expectations.

        let ctrl = h.controller();
        ctrl.sync_domain("app/ok.example.com".to_string(), 0)
            .await
            .unwrap();
        ctrl.sync_domain("app/failed.example.com".to_string(), 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sync_of_a_deleted_domain_is_success() {
        let h = Harness::new();
        let ctrl = h.controller();
        ctrl.sync_domain("app/gone.example.com".to_string(), 0)
            .await
            .unwrap();
    }

    #[test]
    fn hosts_are_unique_and_ordered() {
        let mut ing = ingress("app", "web", "a.example.com", "/", "svc1", 80);
        let rules = ing.spec.as_mut().unwrap().rules.as_mut().unwrap();
        let mut dup = rules[0].clone();
        dup.host = Some("a.example.com".to_string());
        let mut second = rules[0].clone();
        second.host = Some("b.example.com".to_string());
        let mut empty = rules[0].clone();
        empty.host = None;
        rules.extend([dup, second, empty]);

        assert_eq!(
            hosts_from_ingress(&ing),
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );
    }
}
