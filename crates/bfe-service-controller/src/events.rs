//! Kubernetes Events on reconciled Services
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! the reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` is reported as the Event's reporting component
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
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
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    pub const POOLS_SYNCED: &str = "PoolsSynced";
    pub const POOLS_SYNC_FAILED: &str = "PoolsSyncFailed";
    pub const POOLS_RELEASED: &str = "PoolsReleased";
    pub const POOLS_RELEASE_FAILED: &str = "PoolsReleaseFailed";
}

/// Event actions, shown under ACTION in `kubectl get events`
pub mod actions {
    pub const UPDATE: &str = "Update";
    pub const DELETE: &str = "Delete";
}
