//! Events attached to Kubeconfig objects
//!
//! `kubectl describe kubeconfig <name>` lists what the controller changed on
//! each pass. Publishing never fails a pass; a rejected event only produces a
//! warning log.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for events about a Kubeconfig request
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Attach an event to `resource_ref`
    ///
    /// `reason` is one of [`reasons`], `action` one of [`actions`]. `note`
    /// is the line shown to whoever describes the request.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Writes events through the API server as the controller
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Publisher reporting as `controller_name`
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
                "Event rejected by API server"
            );
        }
    }
}

/// Drops every event, for contexts assembled without a cluster
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

/// Reasons shown in the event list of a Kubeconfig
pub mod reasons {
    /// ServiceAccount, token Secret and RBAC objects applied
    pub const PERMISSIONS_PROVISIONED: &str = "PermissionsProvisioned";
    /// Objects no longer desired were deleted
    pub const STALE_PERMISSIONS_REMOVED: &str = "StalePermissionsRemoved";
    /// A new token was issued and the kubeconfig Secret rewritten
    pub const TOKEN_ROTATED: &str = "TokenRotated";
    /// A reconciliation pass failed
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// Cleanup finished and the finalizer was released
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
}

/// What the controller was doing when it published an event
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Token issuance
    pub const ROTATE: &str = "Rotate";
    /// Deletion of owned objects
    pub const CLEANUP: &str = "Cleanup";
}
