//! InstancePool controller implementation
//!
//! Keeps the number of Instances of a pool equal to `spec.count`. Growth goes
//! through `TokenReady` (join material resolved, Instances created under the
//! pool's submission lock), shrinking through `CleanupNodes`. Progress is
//! observed in `Submitted`/`Ready`, which the Instance watch re-triggers
//! whenever a member becomes managed or goes away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret, Service};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::{Instance, InstancePool, InstancePoolStatus, PoolPhase};
use fleet_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use fleet_common::kube_utils::{load_balancer_address, status_patch, CONTROL_PLANE_SELECTOR};
use fleet_common::retry::KeyedBackoff;
use fleet_common::{Error, MetalCredentials, OperatorConfig, FIELD_MANAGER, POOL_LABEL};

use crate::bootstrap::{resolve_join_token, synthesize_instance, JoinMaterial};
use crate::locks::SubmissionLocks;
use crate::sizing::{after_removals, creatable, observe, removal_candidates, settle};

/// Requeue delay between the phases of one growth or shrink cycle
const STEP_REQUEUE: Duration = Duration::from_secs(1);

/// Kubernetes operations the InstancePool controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolKube: Send + Sync {
    /// Merge-patch the status of an InstancePool
    async fn patch_status(&self, name: &str, status: &InstancePoolStatus) -> Result<(), Error>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// List the control-plane Nodes
    async fn list_control_plane_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// List the Instances labelled with `pool`
    async fn list_instances(&self, pool: &str) -> Result<Vec<Instance>, Error>;

    /// Create an Instance
    async fn create_instance(&self, instance: &Instance) -> Result<(), Error>;

    /// Delete an Instance; absent Instances are ignored
    async fn delete_instance(&self, name: &str) -> Result<(), Error>;
}

/// [`PoolKube`] backed by the API server
pub struct PoolKubeImpl {
    client: Client,
}

impl PoolKubeImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PoolKube for PoolKubeImpl {
    async fn patch_status(&self, name: &str, status: &InstancePoolStatus) -> Result<(), Error> {
        let api: Api<InstancePool> = Api::all(self.client.clone());
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch(status)),
        )
        .await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_control_plane_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().labels(CONTROL_PLANE_SELECTOR))
            .await?;
        Ok(nodes.items)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(svc) => Ok(Some(svc)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_instances(&self, pool: &str) -> Result<Vec<Instance>, Error> {
        let api: Api<Instance> = Api::all(self.client.clone());
        let selector = format!("{POOL_LABEL}={pool}");
        let instances = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(instances.items)
    }

    async fn create_instance(&self, instance: &Instance) -> Result<(), Error> {
        let api: Api<Instance> = Api::all(self.client.clone());
        api.create(&PostParams::default(), instance).await?;
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), Error> {
        let api: Api<Instance> = Api::all(self.client.clone());
        match api.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(instance = %name, "Instance already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared state of the InstancePool controller
pub struct Context {
    /// Kubernetes operations
    pub kube: Arc<dyn PoolKube>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Secret location, join settings and defaults
    pub config: OperatorConfig,
    /// Per-pool submission locks
    pub locks: SubmissionLocks,
    /// Per-pool error backoff
    pub backoff: KeyedBackoff,
}

impl Context {
    /// Production context using the API server and the Kubernetes event recorder
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            kube: Arc::new(PoolKubeImpl::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, "fleet-pool-controller")),
            config,
            locks: SubmissionLocks::new(),
            backoff: KeyedBackoff::default(),
        }
    }

    /// Context over a mock, with events dropped
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn PoolKube>, config: OperatorConfig) -> Self {
        Self {
            kube,
            events: Arc::new(fleet_common::events::NoopEventPublisher),
            config,
            locks: SubmissionLocks::new(),
            backoff: KeyedBackoff::default(),
        }
    }
}

/// Reconcile an InstancePool
#[instrument(skip(pool, ctx), fields(pool = %pool.name_any(), phase = %pool.phase()))]
pub async fn reconcile(pool: Arc<InstancePool>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = pool.name_any();

    if pool.meta().deletion_timestamp.is_some() {
        // Instances go with the pool through their owner references
        ctx.backoff.reset(&name);
        return Ok(Action::await_change());
    }

    let result = match pool.phase() {
        PoolPhase::Empty => prepare(&pool, &ctx).await,
        PoolPhase::TokenReady => submit_instances(&pool, &ctx).await,
        PoolPhase::Submitted | PoolPhase::Ready => observe_fleet(&pool, &ctx).await,
        PoolPhase::CleanupNodes => remove_instances(&pool, &ctx).await,
    };

    match result {
        Ok(action) => {
            ctx.backoff.reset(&name);
            Ok(action)
        }
        Err(e) => {
            if matches!(e, Error::Validation { .. } | Error::Configuration { .. }) {
                publish(
                    &ctx,
                    &pool,
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    e.to_string(),
                )
                .await;
            }
            Err(e)
        }
    }
}

/// Requeue a failed InstancePool with per-key exponential backoff
pub fn error_policy(pool: Arc<InstancePool>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = pool.name_any();
    let delay = ctx.backoff.next_delay(&name);
    if error.is_retryable() {
        warn!(pool = %name, %error, retry_in = ?delay, "InstancePool reconciliation failed");
    } else {
        error!(
            pool = %name,
            %error,
            retry_in = ?delay,
            "InstancePool reconciliation failed, operator action required"
        );
    }
    Action::requeue(delay)
}

/// Empty: resolve the join token and record the initial request
async fn prepare(pool: &InstancePool, ctx: &Context) -> Result<Action, Error> {
    let name = pool.name_any();
    pool.spec
        .validate()
        .map_err(|e| Error::validation_for(&name, e.to_string()))?;

    let token = resolve_join_token(&ctx.config).await?;

    let status = InstancePoolStatus {
        phase: PoolPhase::TokenReady,
        ready: 0,
        requested: pool.spec.count,
        needed: pool.spec.count,
        token: Some(token),
    };
    ctx.kube.patch_status(&name, &status).await?;
    info!(count = pool.spec.count, "join token resolved");
    Ok(Action::requeue(STEP_REQUEUE))
}

/// TokenReady: create the missing Instances
async fn submit_instances(pool: &InstancePool, ctx: &Context) -> Result<Action, Error> {
    let name = pool.name_any();
    let _guard = ctx.locks.acquire(&name).await;

    let config = &ctx.config;
    let secret = ctx
        .kube
        .get_secret(&config.namespace, &config.credential_secret)
        .await?
        .ok_or_else(|| {
            Error::configuration(
                "credentials",
                format!(
                    "secret {}/{} not found",
                    config.namespace, config.credential_secret
                ),
            )
        })?;
    let credentials =
        MetalCredentials::from_secret_data(&config.credential_secret, secret.data.as_ref())?;

    if ctx.kube.list_control_plane_nodes().await?.is_empty() {
        warn!("no control-plane nodes found");
        publish(
            ctx,
            pool,
            EventType::Warning,
            reasons::NO_CONTROL_PLANE,
            actions::SCALE,
            "no control-plane nodes found".to_string(),
        )
        .await;
    }

    let join_address = join_address(ctx).await?;
    let token = match pool.status.as_ref().and_then(|s| s.token.clone()) {
        Some(token) => token,
        None => resolve_join_token(config).await?,
    };

    let mut status = pool.status.clone().unwrap_or_default();
    let present = observe(&ctx.kube.list_instances(&name).await?).present;
    let to_create = creatable(pool.spec.count, status.needed, present);

    let material = JoinMaterial {
        credentials: &credentials,
        token: &token,
        join_address: &join_address,
    };
    for _ in 0..to_create {
        let instance = synthesize_instance(pool, &material, config)?;
        ctx.kube.create_instance(&instance).await?;
        info!(instance = %instance.name_any(), "instance created");
    }

    status.phase = PoolPhase::Submitted;
    status.requested = pool.spec.count;
    status.needed = 0;
    status.token = Some(token);
    ctx.kube.patch_status(&name, &status).await?;

    if to_create > 0 {
        publish(
            ctx,
            pool,
            EventType::Normal,
            reasons::POOL_SCALED_UP,
            actions::SCALE,
            format!("created {to_create} instances"),
        )
        .await;
    }
    Ok(Action::requeue(config.poll_interval))
}

/// Submitted / Ready: compare the fleet against the desired count
async fn observe_fleet(pool: &InstancePool, ctx: &Context) -> Result<Action, Error> {
    let name = pool.name_any();
    let status = pool.status.clone().unwrap_or_default();
    let observed = observe(&ctx.kube.list_instances(&name).await?);
    let next = settle(pool.spec.count, &status, observed);

    if next != status {
        ctx.kube.patch_status(&name, &next).await?;
        debug!(
            phase = %next.phase,
            ready = next.ready,
            needed = next.needed,
            "pool status updated"
        );
    }

    match next.phase {
        PoolPhase::Ready => {
            if status.phase != PoolPhase::Ready {
                info!(ready = next.ready, "pool ready");
                publish(
                    ctx,
                    pool,
                    EventType::Normal,
                    reasons::POOL_READY,
                    actions::RECONCILE,
                    format!("{} instances managed", next.ready),
                )
                .await;
            }
            Ok(Action::await_change())
        }
        PoolPhase::TokenReady | PoolPhase::CleanupNodes => Ok(Action::requeue(STEP_REQUEUE)),
        PoolPhase::Empty | PoolPhase::Submitted => Ok(Action::requeue(ctx.config.poll_interval)),
    }
}

/// CleanupNodes: delete surplus Instances, newest first
async fn remove_instances(pool: &InstancePool, ctx: &Context) -> Result<Action, Error> {
    let name = pool.name_any();
    let status = pool.status.clone().unwrap_or_default();
    let instances = ctx.kube.list_instances(&name).await?;

    let victims = removal_candidates(&instances, -status.needed);
    let mut removed = 0;
    for victim in &victims {
        ctx.kube.delete_instance(victim).await?;
        removed += 1;
        info!(instance = %victim, "instance removed");
    }

    let next = after_removals(&status, removed);
    ctx.kube.patch_status(&name, &next).await?;

    if removed > 0 {
        publish(
            ctx,
            pool,
            EventType::Normal,
            reasons::POOL_SCALED_DOWN,
            actions::SCALE,
            format!("removed {removed} instances"),
        )
        .await;
    }
    Ok(Action::requeue(STEP_REQUEUE))
}

async fn join_address(ctx: &Context) -> Result<String, Error> {
    let config = &ctx.config;
    let context = format!("{}/{}", config.ingress_namespace, config.ingress_service);
    let service = ctx
        .kube
        .get_service(&config.ingress_namespace, &config.ingress_service)
        .await?
        .ok_or_else(|| Error::provisioning_for(&context, "ingress service not found"))?;
    load_balancer_address(&service).ok_or_else(|| {
        Error::provisioning_for(&context, "ingress service has no external address yet")
    })
}

async fn publish(
    ctx: &Context,
    pool: &InstancePool,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&pool.object_ref(&()), type_, reason, action, Some(note))
        .await;
}
