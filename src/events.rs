//! Kubernetes Event publishing.
//!
//! Reconcile failures that users can act on (missing service, rejected
//! plugin, unclaimed domain) surface as Events on the source resource.
//! Publishing is fire-and-forget: a failed event is logged and never breaks
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for user-visible events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record a warning event on the given resource.
    async fn warn(&self, resource_ref: &ObjectReference, reason: &str, note: String);

    /// Record a normal event on the given resource.
    async fn normal(&self, resource_ref: &ObjectReference, reason: &str, note: String);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn warn(&self, resource_ref: &ObjectReference, reason: &str, note: String) {
        self.publish(resource_ref, EventType::Warning, reason, note)
            .await;
    }

    async fn normal(&self, resource_ref: &ObjectReference, reason: &str, note: String) {
        self.publish(resource_ref, EventType::Normal, reason, note)
            .await;
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn warn(&self, _resource_ref: &ObjectReference, _reason: &str, _note: String) {}

    async fn normal(&self, _resource_ref: &ObjectReference, _reason: &str, _note: String) {}
}
