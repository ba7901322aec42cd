//! Controller wiring
//!
//! Two controllers share one client:
//!
//! - Instances, re-triggered by Node changes through the Instance reflector
//!   store (a Node and its Instance share a name)
//! - InstancePools, re-triggered by Instance changes through the pool
//!   relation index
//!
//! Both stop on SIGTERM/SIGINT after draining in-flight reconciliations.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use fleet_common::crd::{Instance, InstancePool};
use fleet_common::relations::PoolIndex;
use fleet_common::OperatorConfig;
use fleet_provisioner::MetalProvisioner;

/// Run both controllers until shutdown
pub async fn run(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let provisioner = Arc::new(
        MetalProvisioner::new(config.metal_api_url.clone(), config.ipxe_script_url.clone())
            .map_err(|e| anyhow::anyhow!("Failed to create provisioning client: {}", e))?,
    );

    let instance_ctx = Arc::new(
        fleet_instance::Context::builder(client.clone(), provisioner)
            .config(config.clone())
            .build(),
    );
    let pool_ctx = Arc::new(fleet_pool::Context::new(client.clone(), config));

    let instances: Api<Instance> = Api::all(client.clone());
    let pools: Api<InstancePool> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    tracing::info!("Starting fleet controllers...");
    tracing::info!("  - Instance controller");
    tracing::info!("  - InstancePool controller");

    let instance_controller = Controller::new(instances.clone(), WatcherConfig::default());
    let store = instance_controller.store();
    let instance_controller = instance_controller
        .watches(nodes, WatcherConfig::default(), move |node| {
            fleet_instance::instance_for_node(&store, &node)
        })
        .shutdown_on_signal()
        .run(
            fleet_instance::reconcile,
            fleet_instance::error_policy,
            instance_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(instance = %obj.name, ?action, "Instance reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Instance reconciliation error");
                }
            }
        });

    let index = Arc::new(PoolIndex::new());
    let pool_controller = Controller::new(pools, WatcherConfig::default())
        .watches(instances, WatcherConfig::default(), move |instance| {
            pool_for_instance(&index, &instance)
        })
        .shutdown_on_signal()
        .run(fleet_pool::reconcile, fleet_pool::error_policy, pool_ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(pool = %obj.name, ?action, "InstancePool reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "InstancePool reconciliation error");
                }
            }
        });

    tokio::join!(instance_controller, pool_controller);
    Ok(())
}

/// Pool to wake up for an Instance watch event
///
/// Once the last finalizer is gone the Instance is about to vanish, so it is
/// dropped from the index after the pool has been woken.
fn pool_for_instance(index: &PoolIndex, instance: &Instance) -> Option<ObjectRef<InstancePool>> {
    let pool = index.observe(instance);
    if instance.is_deleting() && instance.finalizers().is_empty() {
        index.forget(&instance.name_any());
    }
    pool.map(|name| ObjectRef::new(&name))
}
