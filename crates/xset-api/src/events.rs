//! Kubernetes Event recording for the XSet engine
//!
//! A trait-based abstraction over `kube::runtime::events::Recorder` so the
//! engine can emit standard Kubernetes Events visible via `kubectl describe`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "failed to publish kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings
pub mod reasons {
    /// Unused instance IDs were pruned from a ResourceContext (Warning)
    pub const RESOURCE_CONTEXT_CLEAN: &str = "ResourceContextClean";
    /// Targets are being deleted gracefully during teardown (Normal)
    pub const TARGETS_DELETED: &str = "TargetsDeleted";
    /// Adding the teardown finalizer failed (Warning)
    pub const FAILED_ADD_FINALIZER: &str = "FailedAddFinalizer";
    /// Removing the teardown finalizer failed (Warning)
    pub const FAILED_REMOVE_FINALIZER: &str = "FailedRemoveFinalizer";
}

/// Well-known event action strings
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Allocating or pruning instance IDs
    pub const ALLOCATE: &str = "Allocate";
    /// Deleting targets or the parent itself
    pub const DELETE: &str = "Delete";
}
