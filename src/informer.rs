//! Typed list-watch caches.
//!
//! Each [`Informer`] owns a watch on one resource kind and keeps a reflector
//! [`Store`] up to date; the store is the synchronous cache the reconcilers
//! read. `run` additionally synthesizes Add/Update/Delete callbacks so the
//! controller can enqueue work keys. Watch errors are logged and retried by
//! the watcher's backoff; they never reach the handler.

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cache event handed to the controller's subscription.
pub enum InformerEvent<K> {
    /// Object appeared (initial list or fresh create)
    Add(K),
    /// Object changed; `old` is the previously cached state
    Update {
        /// Cached state before this delivery
        old: Arc<K>,
        /// State as delivered by the watch
        new: K,
    },
    /// Object removed; carries the final observed state
    Delete(K),
}

/// A list-watch cache for one resource kind.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    api: Api<K>,
    writer: Writer<K>,
    store: Store<K>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Create an informer over the given API scope.
    pub fn new(api: Api<K>) -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self { api, writer, store }
    }

    /// Handle to the backing store. Ready once the initial list completes
    /// (`Store::wait_until_ready`).
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Drive the watch until the stop token fires, applying every event to
    /// the store and invoking `handler` per object.
    ///
    /// Re-list deliveries for objects already in the cache surface as
    /// `Update`, matching resync semantics.
    pub async fn run<F>(self, handler: F, stop: CancellationToken)
    where
        F: Fn(InformerEvent<K>) + Send + 'static,
    {
        let Informer {
            api,
            mut writer,
            store,
        } = self;
        let kind = K::kind(&());
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        futures::pin_mut!(stream);

        loop {
            let item = tokio::select! {
                _ = stop.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    // Look up the prior state before the writer applies the
                    // event so updates can expose old and new.
                    let prior = match &event {
                        watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                            store.get(&ObjectRef::from_obj(obj))
                        }
                        _ => None,
                    };
                    writer.apply_watcher_event(&event);
                    match event {
                        watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
                            match prior {
                                Some(old) => handler(InformerEvent::Update { old, new: obj }),
                                None => handler(InformerEvent::Add(obj)),
                            }
                        }
                        watcher::Event::Delete(obj) => handler(InformerEvent::Delete(obj)),
                        watcher::Event::Init | watcher::Event::InitDone => {}
                    }
                }
                Some(Err(err)) => {
                    warn!(kind = %kind, error = %err, "watch stream error, backing off");
                }
                None => break,
            }
        }
        debug!(kind = %kind, "informer stopping");
    }
}

/// Canonical work-queue key for an object: `namespace/name`, or just `name`
/// for cluster-scoped resources.
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Split a work-queue key back into `(namespace, name)`.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    fn service(ns: &str, name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn keys_are_namespace_slash_name() {
        let svc = service("app", "web");
        assert_eq!(object_key(&svc), "app/web");
        assert_eq!(split_key("app/web"), (Some("app"), "web"));
        assert_eq!(split_key("web"), (None, "web"));
    }

    #[test]
    fn store_reflects_applied_events() {
        let mut writer = Writer::<Service>::default();
        let store = writer.as_reader();

        writer.apply_watcher_event(&watcher::Event::Apply(service("app", "web")));
        let found = store
            .get(&ObjectRef::new("web").within("app"))
            .expect("cached");
        assert_eq!(found.metadata.namespace.as_deref(), Some("app"));

        writer.apply_watcher_event(&watcher::Event::Delete(service("app", "web")));
        assert!(store.get(&ObjectRef::new("web").within("app")).is_none());
    }
}
