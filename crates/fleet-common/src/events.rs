//! Kubernetes Event recording for the fleet controllers
//!
//! Controllers publish through the [`EventPublisher`] trait so tests can
//! capture or ignore events. Publishing never fails a reconciliation pass:
//! errors from the API server are logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about fleet resources
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
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
            warn!(reason, action, error = %e, "Failed to publish event");
        }
    }
}

/// Publisher that drops every event
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

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// A device was requested from the backend
    pub const DEVICE_CREATED: &str = "DeviceCreated";
    /// An existing device with the Instance's hostname was adopted
    pub const DEVICE_ADOPTED: &str = "DeviceAdopted";
    /// The backend reported the device as failed
    pub const DEVICE_FAILED: &str = "DeviceFailed";
    /// The device was reconfigured and is reinstalling
    pub const DEVICE_REINSTALLING: &str = "DeviceReinstalling";
    /// The device was deprovisioned
    pub const DEVICE_DELETED: &str = "DeviceDeleted";
    /// The device is active with its final configuration
    pub const INSTANCE_READY: &str = "InstanceReady";
    /// The machine joined the cluster
    pub const INSTANCE_MANAGED: &str = "InstanceManaged";
    /// The cluster member stayed unhealthy and the Instance is being replaced
    pub const INSTANCE_REMEDIATED: &str = "InstanceRemediated";
    /// The cluster member disappeared
    pub const NODE_LOST: &str = "NodeLost";
    /// The pool created Instances
    pub const POOL_SCALED_UP: &str = "PoolScaledUp";
    /// The pool deleted surplus Instances
    pub const POOL_SCALED_DOWN: &str = "PoolScaledDown";
    /// Every Instance of the pool is a cluster member
    pub const POOL_READY: &str = "PoolReady";
    /// No control-plane members were found while growing a pool
    pub const NO_CONTROL_PLANE: &str = "NoControlPlane";
    /// The spec was rejected
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Regular reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Device provisioning
    pub const PROVISION: &str = "Provision";
    /// Device reconfiguration
    pub const RECONFIGURE: &str = "Reconfigure";
    /// Deletion of a device or record
    pub const DELETE: &str = "Delete";
    /// Changing the size of a pool
    pub const SCALE: &str = "Scale";
}
