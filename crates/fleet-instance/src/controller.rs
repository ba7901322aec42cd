//! Instance controller implementation
//!
//! Drives one machine through `Empty -> Submitted -> Reinstalling -> Ready ->
//! Managed`. Every pass performs at most one remote side effect and writes
//! the outcome to status before requeueing, so a restart resumes from the
//! recorded phase.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::{Instance, InstancePhase, InstanceStatus};
use fleet_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use fleet_common::kube_utils::{
    finalizer_patch, finalizers_with, finalizers_without, has_finalizer, node_health,
    remaining_unhealthy_wait, status_patch, NodeHealth,
};
use fleet_common::retry::KeyedBackoff;
use fleet_common::{Error, MetalCredentials, OperatorConfig, FIELD_MANAGER, INSTANCE_FINALIZER};
use fleet_provisioner::{DeviceState, DeviceStatus, Provisioner};

/// Requeue delay after the finalizer has been added
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Kubernetes operations the Instance controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceKube: Send + Sync {
    /// Merge-patch the status of an Instance
    async fn patch_status(&self, name: &str, status: &InstanceStatus) -> Result<(), Error>;

    /// Add the deprovision finalizer (no-op when present)
    async fn add_finalizer(&self, name: &str) -> Result<(), Error>;

    /// Remove the deprovision finalizer
    async fn remove_finalizer(&self, name: &str) -> Result<(), Error>;

    /// Delete an Instance; absent Instances are ignored
    async fn delete_instance(&self, name: &str) -> Result<(), Error>;

    /// Get the Node named `name`
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Delete the Node named `name`; absent Nodes are ignored
    async fn delete_node(&self, name: &str) -> Result<(), Error>;
}

/// [`InstanceKube`] backed by the API server
pub struct InstanceKubeImpl {
    client: Client,
}

impl InstanceKubeImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn instances(&self) -> Api<Instance> {
        Api::all(self.client.clone())
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl InstanceKube for InstanceKubeImpl {
    async fn patch_status(&self, name: &str, status: &InstanceStatus) -> Result<(), Error> {
        self.instances()
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch(status)),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, name: &str) -> Result<(), Error> {
        let api = self.instances();
        let instance = api.get(name).await?;
        let Some(finalizers) = finalizers_with(&instance.metadata, INSTANCE_FINALIZER) else {
            return Ok(());
        };
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&finalizer_patch(&finalizers)),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, name: &str) -> Result<(), Error> {
        let api = self.instances();
        let instance = match api.get(name).await {
            Ok(i) => i,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let finalizers = finalizers_without(&instance.metadata, INSTANCE_FINALIZER);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&finalizer_patch(&finalizers)),
        )
        .await?;
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), Error> {
        match self.instances().delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(instance = %name, "Instance already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        match self.nodes().get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        match self.nodes().delete(name, &Default::default()).await {
            Ok(_) => {
                info!(node = %name, "Node deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared state of the Instance controller
pub struct Context {
    /// Kubernetes operations
    pub kube: Arc<dyn InstanceKube>,
    /// Provisioning backend
    pub provisioner: Arc<dyn Provisioner>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Requeue intervals and defaults
    pub config: OperatorConfig,
    /// Per-Instance error backoff
    pub backoff: KeyedBackoff,
    /// When each managed Instance's Node was first seen not ready, for Nodes
    /// whose Ready condition carries no transition time
    pub unready_since: DashMap<String, DateTime<Utc>>,
}

impl Context {
    /// Create a builder for a production context
    pub fn builder(client: Client, provisioner: Arc<dyn Provisioner>) -> ContextBuilder {
        ContextBuilder {
            client,
            provisioner,
            kube: None,
            events: None,
            config: OperatorConfig::default(),
        }
    }

    /// Context over mocks, with events dropped and default intervals
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn InstanceKube>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            kube,
            provisioner,
            events: Arc::new(fleet_common::events::NoopEventPublisher),
            config: OperatorConfig::default(),
            backoff: KeyedBackoff::default(),
            unready_since: DashMap::new(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    provisioner: Arc<dyn Provisioner>,
    kube: Option<Arc<dyn InstanceKube>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: OperatorConfig,
}

impl ContextBuilder {
    /// Use `config` for intervals and defaults
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes operations
    pub fn kube(mut self, kube: Arc<dyn InstanceKube>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(InstanceKubeImpl::new(self.client.clone()))),
            provisioner: self.provisioner,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    "fleet-instance-controller",
                ))
            }),
            config: self.config,
            backoff: KeyedBackoff::default(),
            unready_since: DashMap::new(),
        }
    }
}

/// Reconcile an Instance
///
/// Non-retryable failures are also published as Warning events so they are
/// visible on the object.
#[instrument(skip(instance, ctx), fields(instance = %instance.name_any(), phase = %instance.phase()))]
pub async fn reconcile(instance: Arc<Instance>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = instance.name_any();

    let result = if instance.is_deleting() {
        handle_removal(&instance, &ctx).await
    } else {
        reconcile_phase(&instance, &ctx).await
    };

    match result {
        Ok(action) => {
            ctx.backoff.reset(&name);
            Ok(action)
        }
        Err(e) => {
            if !e.is_retryable() {
                let reason = match &e {
                    Error::Validation { .. } => reasons::VALIDATION_FAILED,
                    _ => reasons::DEVICE_FAILED,
                };
                ctx.events
                    .publish(
                        &instance.object_ref(&()),
                        EventType::Warning,
                        reason,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
            Err(e)
        }
    }
}

/// Requeue a failed Instance with per-key exponential backoff
pub fn error_policy(instance: Arc<Instance>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = instance.name_any();
    let delay = ctx.backoff.next_delay(&name);
    if error.is_retryable() {
        warn!(instance = %name, %error, retry_in = ?delay, "Instance reconciliation failed");
    } else {
        error!(
            instance = %name,
            %error,
            retry_in = ?delay,
            "Instance reconciliation failed, operator action required"
        );
    }
    Action::requeue(delay)
}

async fn reconcile_phase(instance: &Instance, ctx: &Context) -> Result<Action, Error> {
    match instance.phase() {
        InstancePhase::Empty => submit_device(instance, ctx).await,
        InstancePhase::Submitted => await_provisioned(instance, ctx).await,
        InstancePhase::Reinstalling => await_reinstalled(instance, ctx).await,
        InstancePhase::Ready => await_member(instance, ctx).await,
        InstancePhase::Managed => check_member_health(instance, ctx).await,
    }
}

/// Empty: ensure the finalizer, then adopt or create the device
async fn submit_device(instance: &Instance, ctx: &Context) -> Result<Action, Error> {
    let name = instance.name_any();

    if !has_finalizer(&instance.metadata, INSTANCE_FINALIZER) {
        ctx.kube.add_finalizer(&name).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    if let Some(networking) = instance
        .spec
        .networking_configuration
        .as_ref()
        .filter(|n| !n.is_empty())
    {
        networking.parsed_type().map_err(|e| {
            Error::validation_for_field(&name, "spec.networkingConfiguration.type", e.to_string())
        })?;
    }
    instance.spec.cleanup_wait()?;

    let credentials = MetalCredentials::from_instance(instance)?;

    // A device with our hostname means an earlier pass created it but crashed
    // before recording the id.
    let (device, reason) = match ctx.provisioner.find_by_hostname(&credentials, &name).await? {
        Some(device) => {
            info!(device = %device.id, "adopting existing device");
            (device, reasons::DEVICE_ADOPTED)
        }
        None => {
            let device = ctx.provisioner.create(&credentials, instance).await?;
            info!(device = %device.id, state = %device.state, "device requested");
            (device, reasons::DEVICE_CREATED)
        }
    };

    let mut status = current_status(instance);
    status.phase = InstancePhase::Submitted;
    status.instance_id = Some(device.id.clone());
    status.device_state = Some(device.state.to_string());
    ctx.kube.patch_status(&name, &status).await?;

    publish(
        ctx,
        instance,
        EventType::Normal,
        reason,
        actions::PROVISION,
        format!("device {}", device.id),
    )
    .await;
    Ok(Action::requeue(ctx.config.poll_interval))
}

/// Submitted: wait for the first install to settle, then reconfigure
async fn await_provisioned(instance: &Instance, ctx: &Context) -> Result<Action, Error> {
    let name = instance.name_any();
    let credentials = MetalCredentials::from_instance(instance)?;
    let Some(device) = poll_device(instance, ctx, &credentials).await? else {
        return Ok(Action::requeue(ctx.config.poll_interval));
    };

    if device.state.is_settled() {
        ctx.provisioner.reconfigure(&credentials, instance).await?;

        let mut status = current_status(instance);
        status.phase = InstancePhase::Reinstalling;
        status.device_state = Some(device.state.to_string());
        ctx.kube.patch_status(&name, &status).await?;

        publish(
            ctx,
            instance,
            EventType::Normal,
            reasons::DEVICE_REINSTALLING,
            actions::RECONFIGURE,
            format!("device {} reinstalling with final configuration", device.id),
        )
        .await;
        return Ok(Action::requeue(ctx.config.poll_interval));
    }

    observe_pending(instance, ctx, &device).await?;
    Ok(Action::requeue(ctx.config.poll_interval))
}

/// Reinstalling: wait for the device to come back active and record addresses
async fn await_reinstalled(instance: &Instance, ctx: &Context) -> Result<Action, Error> {
    let name = instance.name_any();
    let credentials = MetalCredentials::from_instance(instance)?;
    let Some(device) = poll_device(instance, ctx, &credentials).await? else {
        return Ok(Action::requeue(ctx.config.poll_interval));
    };

    if device.state == DeviceState::Active {
        let mut status = current_status(instance);
        status.phase = InstancePhase::Ready;
        status.device_state = Some(device.state.to_string());
        status.public_ip = device.public_ipv4.clone();
        status.private_ip = device.private_ipv4.clone();
        ctx.kube.patch_status(&name, &status).await?;

        info!(public_ip = ?device.public_ipv4, "device ready");
        publish(
            ctx,
            instance,
            EventType::Normal,
            reasons::INSTANCE_READY,
            actions::RECONCILE,
            format!("device {} active", device.id),
        )
        .await;
        return Ok(Action::requeue(ctx.config.ready_check_interval));
    }

    observe_pending(instance, ctx, &device).await?;
    Ok(Action::requeue(ctx.config.poll_interval))
}

/// Ready: wait for the machine to join the cluster
///
/// A Node that is already terminating joined and left before this pass saw
/// it, so the Instance is removed like a lost member.
async fn await_member(instance: &Instance, ctx: &Context) -> Result<Action, Error> {
    let name = instance.name_any();
    let Some(node) = ctx.kube.get_node(&name).await? else {
        debug!("waiting for node to join");
        return Ok(Action::requeue(ctx.config.ready_check_interval));
    };

    if node.metadata.deletion_timestamp.is_some() {
        warn!("node terminating before it was managed, deleting instance");
        publish(
            ctx,
            instance,
            EventType::Warning,
            reasons::NODE_LOST,
            actions::DELETE,
            format!("node {name} left the cluster"),
        )
        .await;
        ctx.kube.delete_instance(&name).await?;
        return Ok(Action::await_change());
    }

    let mut status = current_status(instance);
    status.phase = InstancePhase::Managed;
    ctx.kube.patch_status(&name, &status).await?;

    info!("node joined, instance managed");
    publish(
        ctx,
        instance,
        EventType::Normal,
        reasons::INSTANCE_MANAGED,
        actions::RECONCILE,
        format!("node {name} joined the cluster"),
    )
    .await;
    Ok(Action::await_change())
}

/// Health of the cluster member backing a managed Instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberVerdict {
    /// Ready, or not ready with no cleanup interval configured
    Healthy,
    /// Not ready; look again after this long
    Recheck(Duration),
    /// Missing or terminating
    Lost,
    /// Not ready for at least the cleanup interval
    Unhealthy,
}

/// Judge a managed Instance's Node at `now`
///
/// `first_seen_unready` stands in for the Ready condition's transition time
/// when the Node does not report one. With neither, the Node became not
/// ready at `now`.
pub fn assess_member(
    node: Option<&Node>,
    cleanup_wait: Option<Duration>,
    first_seen_unready: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> MemberVerdict {
    let Some(node) = node.filter(|n| n.metadata.deletion_timestamp.is_none()) else {
        return MemberVerdict::Lost;
    };
    let since = match node_health(node) {
        NodeHealth::Ready => return MemberVerdict::Healthy,
        NodeHealth::NotReady { since } => since,
    };
    let Some(wait) = cleanup_wait else {
        return MemberVerdict::Healthy;
    };
    let since = since.or(first_seen_unready).unwrap_or(now);
    let remaining = remaining_unhealthy_wait(since, wait, now);
    if remaining.is_zero() {
        MemberVerdict::Unhealthy
    } else {
        MemberVerdict::Recheck(remaining)
    }
}

/// Managed: remove Instances whose Node vanished or stayed unhealthy too long
async fn check_member_health(instance: &Instance, ctx: &Context) -> Result<Action, Error> {
    let name = instance.name_any();
    let wait = instance.spec.cleanup_wait()?;
    let node = ctx.kube.get_node(&name).await?;

    let now = Utc::now();
    let first_seen = ctx.unready_since.get(&name).map(|since| *since);
    let verdict = assess_member(node.as_ref(), wait, first_seen, now);
    if !matches!(verdict, MemberVerdict::Recheck(_)) {
        ctx.unready_since.remove(&name);
    }

    let (reason, note) = match verdict {
        MemberVerdict::Healthy => return Ok(Action::await_change()),
        MemberVerdict::Recheck(remaining) => {
            ctx.unready_since.entry(name).or_insert(now);
            debug!(remaining = ?remaining, "node not ready, waiting before remediation");
            return Ok(Action::requeue(remaining));
        }
        MemberVerdict::Lost => {
            warn!("node gone, deleting instance");
            (reasons::NODE_LOST, format!("node {name} left the cluster"))
        }
        MemberVerdict::Unhealthy => {
            warn!(wait = ?wait, "node not ready past cleanup interval, deleting instance");
            let interval = instance
                .spec
                .node_cleanup_wait_interval
                .as_deref()
                .unwrap_or_default();
            (
                reasons::INSTANCE_REMEDIATED,
                format!("node {name} not ready for longer than {interval}"),
            )
        }
    };

    publish(ctx, instance, EventType::Warning, reason, actions::DELETE, note).await;
    ctx.kube.delete_instance(&name).await?;
    Ok(Action::await_change())
}

/// Deprovision the device and Node, then release the finalizer
async fn handle_removal(instance: &Instance, ctx: &Context) -> Result<Action, Error> {
    let name = instance.name_any();
    ctx.unready_since.remove(&name);
    if !has_finalizer(&instance.metadata, INSTANCE_FINALIZER) {
        return Ok(Action::await_change());
    }

    if let Some(device_id) = instance.device_id() {
        let credentials = MetalCredentials::from_instance(instance)?;
        ctx.provisioner.delete(&credentials, device_id).await?;
        info!(device = %device_id, "device deprovisioned");
        publish(
            ctx,
            instance,
            EventType::Normal,
            reasons::DEVICE_DELETED,
            actions::DELETE,
            format!("device {device_id} deprovisioned"),
        )
        .await;
    }

    ctx.kube.delete_node(&name).await?;
    ctx.kube.remove_finalizer(&name).await?;
    info!("finalizer removed");
    Ok(Action::await_change())
}

/// Fetch the recorded device, `None` when there is nothing to act on yet
async fn poll_device(
    instance: &Instance,
    ctx: &Context,
    credentials: &MetalCredentials,
) -> Result<Option<DeviceStatus>, Error> {
    let name = instance.name_any();
    let Some(device_id) = instance.device_id() else {
        return Err(Error::internal_with_context(
            name,
            format!("phase {} without a device id", instance.phase()),
        ));
    };
    let device = ctx.provisioner.status(credentials, device_id).await?;
    if device.is_none() {
        warn!(device = %device_id, "device not found at the backend");
    }
    Ok(device)
}

/// Record an intermediate backend state; a failed device also raises a Warning
async fn observe_pending(
    instance: &Instance,
    ctx: &Context,
    device: &DeviceStatus,
) -> Result<(), Error> {
    let state = device.state.to_string();
    if device.state == DeviceState::Failed {
        warn!(device = %device.id, "device reported failed");
        publish(
            ctx,
            instance,
            EventType::Warning,
            reasons::DEVICE_FAILED,
            actions::PROVISION,
            format!("device {} reported state failed", device.id),
        )
        .await;
    }

    let mut status = current_status(instance);
    if status.device_state.as_deref() == Some(state.as_str()) {
        debug!(state = %state, "device still pending");
        return Ok(());
    }
    status.device_state = Some(state);
    ctx.kube.patch_status(&instance.name_any(), &status).await
}

fn current_status(instance: &Instance) -> InstanceStatus {
    instance.status.clone().unwrap_or_default()
}

async fn publish(
    ctx: &Context,
    instance: &Instance,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&instance.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc as StdArc, Mutex};

    use chrono::Duration as ChronoDuration;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use mockall::mock;

    use fleet_common::crd::InstanceSpec;
    use fleet_common::TOKEN_ANNOTATION;

    use super::*;

    mock! {
        pub Backend {}

        #[async_trait::async_trait]
        impl Provisioner for Backend {
            async fn create(
                &self,
                credentials: &MetalCredentials,
                instance: &Instance,
            ) -> Result<DeviceStatus, Error>;
            async fn status(
                &self,
                credentials: &MetalCredentials,
                device_id: &str,
            ) -> Result<Option<DeviceStatus>, Error>;
            async fn find_by_hostname(
                &self,
                credentials: &MetalCredentials,
                hostname: &str,
            ) -> Result<Option<DeviceStatus>, Error>;
            async fn reconfigure(
                &self,
                credentials: &MetalCredentials,
                instance: &Instance,
            ) -> Result<(), Error>;
            async fn delete(&self, credentials: &MetalCredentials, device_id: &str) -> Result<(), Error>;
        }
    }

    /// Captured status writes, in order
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: StdArc<Mutex<Vec<InstanceStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: InstanceStatus) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(status);
        }

        fn last(&self) -> Option<InstanceStatus> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }

        fn was_updated(&self) -> bool {
            !self
                .updates
                .lock()
                .expect("mutex should not be poisoned")
                .is_empty()
        }
    }

    fn capturing_kube(capture: &StatusCapture) -> MockInstanceKube {
        let capture = capture.clone();
        let mut kube = MockInstanceKube::new();
        kube.expect_patch_status().returning(move |_, status| {
            capture.record(status.clone());
            Ok(())
        });
        kube
    }

    fn sample_instance(phase: InstancePhase) -> Instance {
        let mut instance = Instance::new(
            "pool-a-abcdefgh",
            InstanceSpec {
                plan: "m3.small.x86".into(),
                metro: Some("sv".into()),
                operating_system: "custom_ipxe".into(),
                project_id: Some("proj".into()),
                node_cleanup_wait_interval: Some("10m".into()),
                ..Default::default()
            },
        );
        instance.metadata.finalizers = Some(vec![INSTANCE_FINALIZER.to_string()]);
        instance.metadata.annotations = Some(BTreeMap::from([(
            TOKEN_ANNOTATION.to_string(),
            "tok".to_string(),
        )]));
        instance.status = Some(InstanceStatus {
            phase,
            instance_id: (phase != InstancePhase::Empty).then(|| "d1".to_string()),
            ..Default::default()
        });
        instance
    }

    fn device(state: DeviceState) -> DeviceStatus {
        DeviceStatus {
            id: "d1".into(),
            state,
            public_ipv4: Some("147.75.1.2".into()),
            private_ipv4: Some("10.1.2.3".into()),
        }
    }

    fn node(ready: &str, since: Option<chrono::DateTime<Utc>>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("pool-a-abcdefgh".into()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: ready.into(),
                    last_transition_time: since.map(Time),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn context(kube: MockInstanceKube, backend: MockBackend) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(kube), Arc::new(backend)))
    }

    // =========================================================================
    // Empty
    // =========================================================================

    #[tokio::test]
    async fn first_pass_only_adds_finalizer() {
        let mut instance = sample_instance(InstancePhase::Empty);
        instance.metadata.finalizers = None;
        instance.status = None;

        let mut kube = MockInstanceKube::new();
        kube.expect_add_finalizer()
            .withf(|name| name == "pool-a-abcdefgh")
            .times(1)
            .returning(|_| Ok(()));
        let mut backend = MockBackend::new();
        backend.expect_create().never();

        let action = reconcile(Arc::new(instance), context(kube, backend))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(FINALIZER_REQUEUE));
    }

    #[tokio::test]
    async fn story_empty_instance_creates_device_and_records_id() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let mut backend = MockBackend::new();
        backend.expect_find_by_hostname().returning(|_, _| Ok(None));
        backend
            .expect_create()
            .withf(|creds, _| creds.token == "tok" && creds.project_id == "proj")
            .times(1)
            .returning(|_, _| Ok(device(DeviceState::Queued)));

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Empty)),
            context(kube, backend),
        )
        .await
        .unwrap();

        let status = capture.last().unwrap();
        assert_eq!(status.phase, InstancePhase::Submitted);
        assert_eq!(status.instance_id.as_deref(), Some("d1"));
        assert_eq!(status.device_state.as_deref(), Some("queued"));
        assert_eq!(action, Action::requeue(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn existing_device_with_same_hostname_is_adopted() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let mut backend = MockBackend::new();
        backend
            .expect_find_by_hostname()
            .withf(|_, hostname| hostname == "pool-a-abcdefgh")
            .returning(|_, _| Ok(Some(device(DeviceState::Provisioning))));
        backend.expect_create().never();

        reconcile(
            Arc::new(sample_instance(InstancePhase::Empty)),
            context(kube, backend),
        )
        .await
        .unwrap();

        assert_eq!(capture.last().unwrap().instance_id.as_deref(), Some("d1"));
    }

    /// A quota rejection leaves the Instance untouched in `Empty` and is
    /// retried with growing delays.
    #[tokio::test]
    async fn story_quota_rejection_keeps_instance_empty() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let mut backend = MockBackend::new();
        backend.expect_find_by_hostname().returning(|_, _| Ok(None));
        backend.expect_create().times(1).returning(|_, _| {
            Err(Error::provisioning_permanent(
                "pool-a-abcdefgh",
                "metal API returned 422: quota exceeded",
            ))
        });

        let instance = Arc::new(sample_instance(InstancePhase::Empty));
        let ctx = context(kube, backend);
        let err = reconcile(instance.clone(), ctx.clone()).await.unwrap_err();

        assert!(err.to_string().contains("quota"));
        assert!(!capture.was_updated());

        let first = error_policy(instance.clone(), &err, ctx.clone());
        let second = error_policy(instance, &err, ctx.clone());
        assert_eq!(first, Action::requeue(Duration::from_secs(5)));
        assert_eq!(second, Action::requeue(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn missing_token_is_a_configuration_error() {
        let mut instance = sample_instance(InstancePhase::Empty);
        instance.metadata.annotations = None;

        let mut backend = MockBackend::new();
        backend.expect_create().never();

        let err = reconcile(Arc::new(instance), context(MockInstanceKube::new(), backend))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn unknown_network_type_is_rejected_before_create() {
        let mut instance = sample_instance(InstancePhase::Empty);
        instance.spec.networking_configuration = Some(fleet_common::crd::NetworkingConfiguration {
            network_type: "mesh".into(),
            interfaces: vec![],
        });

        let mut backend = MockBackend::new();
        backend.expect_create().never();

        let err = reconcile(Arc::new(instance), context(MockInstanceKube::new(), backend))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn oversized_cleanup_interval_is_rejected_before_create() {
        let mut instance = sample_instance(InstancePhase::Empty);
        instance.spec.node_cleanup_wait_interval = Some("99999999999999999999999h".into());

        let mut backend = MockBackend::new();
        backend.expect_find_by_hostname().never();
        backend.expect_create().never();

        let err = reconcile(Arc::new(instance), context(MockInstanceKube::new(), backend))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    // =========================================================================
    // Submitted / Reinstalling
    // =========================================================================

    #[tokio::test]
    async fn provisioning_device_records_state_and_waits() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let mut backend = MockBackend::new();
        backend
            .expect_status()
            .returning(|_, _| Ok(Some(device(DeviceState::Provisioning))));
        backend.expect_reconfigure().never();

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Submitted)),
            context(kube, backend),
        )
        .await
        .unwrap();

        let status = capture.last().unwrap();
        assert_eq!(status.phase, InstancePhase::Submitted);
        assert_eq!(status.device_state.as_deref(), Some("provisioning"));
        assert_eq!(action, Action::requeue(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn unchanged_device_state_is_not_rewritten() {
        let mut instance = sample_instance(InstancePhase::Submitted);
        if let Some(status) = instance.status.as_mut() {
            status.device_state = Some("provisioning".into());
        }
        let mut kube = MockInstanceKube::new();
        kube.expect_patch_status().never();
        let mut backend = MockBackend::new();
        backend
            .expect_status()
            .returning(|_, _| Ok(Some(device(DeviceState::Provisioning))));

        reconcile(Arc::new(instance), context(kube, backend))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn active_device_is_reconfigured_once() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let mut backend = MockBackend::new();
        backend
            .expect_status()
            .returning(|_, _| Ok(Some(device(DeviceState::Active))));
        backend.expect_reconfigure().times(1).returning(|_, _| Ok(()));

        reconcile(
            Arc::new(sample_instance(InstancePhase::Submitted)),
            context(kube, backend),
        )
        .await
        .unwrap();

        assert_eq!(capture.last().unwrap().phase, InstancePhase::Reinstalling);
    }

    #[tokio::test]
    async fn failed_reconfigure_keeps_phase() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let mut backend = MockBackend::new();
        backend
            .expect_status()
            .returning(|_, _| Ok(Some(device(DeviceState::Inactive))));
        backend.expect_reconfigure().returning(|_, _| {
            Err(Error::provisioning_for("pool-a-abcdefgh", "metal API returned 503"))
        });

        let err = reconcile(
            Arc::new(sample_instance(InstancePhase::Submitted)),
            context(kube, backend),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert!(!capture.was_updated());
    }

    #[tokio::test]
    async fn vanished_device_is_nothing_to_do() {
        let mut kube = MockInstanceKube::new();
        kube.expect_patch_status().never();
        let mut backend = MockBackend::new();
        backend.expect_status().returning(|_, _| Ok(None));

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Reinstalling)),
            context(kube, backend),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn failed_device_raises_warning_and_keeps_phase() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let mut backend = MockBackend::new();
        backend
            .expect_status()
            .returning(|_, _| Ok(Some(device(DeviceState::Failed))));

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Reinstalling)),
            context(kube, backend),
        )
        .await
        .unwrap();

        let status = capture.last().unwrap();
        assert_eq!(status.phase, InstancePhase::Reinstalling);
        assert_eq!(status.device_state.as_deref(), Some("failed"));
        assert_eq!(action, Action::requeue(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn reinstalled_device_records_addresses() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let mut backend = MockBackend::new();
        backend
            .expect_status()
            .returning(|_, _| Ok(Some(device(DeviceState::Active))));

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Reinstalling)),
            context(kube, backend),
        )
        .await
        .unwrap();

        let status = capture.last().unwrap();
        assert_eq!(status.phase, InstancePhase::Ready);
        assert_eq!(status.public_ip.as_deref(), Some("147.75.1.2"));
        assert_eq!(status.private_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    // =========================================================================
    // Ready / Managed
    // =========================================================================

    #[tokio::test]
    async fn story_ready_instance_becomes_managed_when_node_joins() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_get_node()
            .returning(|_| Ok(Some(node("True", None))));

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Ready)),
            context(kube, MockBackend::new()),
        )
        .await
        .unwrap();

        assert_eq!(capture.last().unwrap().phase, InstancePhase::Managed);
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn ready_instance_waits_for_node() {
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node().returning(|_| Ok(None));
        kube.expect_patch_status().never();

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Ready)),
            context(kube, MockBackend::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn node_leaving_before_managed_deletes_instance() {
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node().returning(|_| {
            let mut n = node("True", None);
            n.metadata.deletion_timestamp = Some(Time(Utc::now()));
            Ok(Some(n))
        });
        kube.expect_patch_status().never();
        kube.expect_delete_instance()
            .withf(|name| name == "pool-a-abcdefgh")
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Ready)),
            context(kube, MockBackend::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn healthy_managed_instance_waits_for_change() {
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node()
            .returning(|_| Ok(Some(node("True", None))));
        kube.expect_delete_instance().never();

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Managed)),
            context(kube, MockBackend::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn unhealthy_member_is_rechecked_at_remaining_interval() {
        let now = Utc::now();
        let since = now - ChronoDuration::minutes(4);
        let n = node("False", Some(since));
        let wait = Some(Duration::from_secs(600));

        assert_eq!(
            assess_member(Some(&n), wait, None, now),
            MemberVerdict::Recheck(Duration::from_secs(360))
        );
        assert_eq!(
            assess_member(Some(&n), wait, None, now + ChronoDuration::minutes(6)),
            MemberVerdict::Unhealthy
        );
        assert_eq!(assess_member(None, wait, None, now), MemberVerdict::Lost);
        assert_eq!(
            assess_member(Some(&node("True", None)), wait, None, now),
            MemberVerdict::Healthy
        );
    }

    #[test]
    fn member_without_transition_time_counts_from_first_sighting() {
        let now = Utc::now();
        let n = node("Unknown", None);
        let wait = Some(Duration::from_secs(60));

        assert_eq!(
            assess_member(Some(&n), wait, None, now),
            MemberVerdict::Recheck(Duration::from_secs(60))
        );
        assert_eq!(
            assess_member(Some(&n), wait, Some(now - ChronoDuration::seconds(45)), now),
            MemberVerdict::Recheck(Duration::from_secs(15))
        );
        assert_eq!(
            assess_member(Some(&n), wait, Some(now - ChronoDuration::minutes(2)), now),
            MemberVerdict::Unhealthy
        );
    }

    #[tokio::test]
    async fn member_without_transition_time_is_remediated_after_interval() {
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node()
            .returning(|_| Ok(Some(node("Unknown", None))));
        kube.expect_delete_instance()
            .withf(|name| name == "pool-a-abcdefgh")
            .times(1)
            .returning(|_| Ok(()));
        let ctx = context(kube, MockBackend::new());
        let instance = Arc::new(sample_instance(InstancePhase::Managed));

        let action = reconcile(instance.clone(), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(600)));
        assert!(ctx.unready_since.contains_key("pool-a-abcdefgh"));

        // Pretend the first sighting was eleven minutes ago
        ctx.unready_since.insert(
            "pool-a-abcdefgh".to_string(),
            Utc::now() - ChronoDuration::minutes(11),
        );
        let action = reconcile(instance, ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.unready_since.is_empty());
    }

    #[tokio::test]
    async fn recovered_member_forgets_first_sighting() {
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node()
            .returning(|_| Ok(Some(node("True", None))));
        kube.expect_delete_instance().never();
        let ctx = context(kube, MockBackend::new());
        ctx.unready_since.insert(
            "pool-a-abcdefgh".to_string(),
            Utc::now() - ChronoDuration::minutes(11),
        );

        let action = reconcile(Arc::new(sample_instance(InstancePhase::Managed)), ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.unready_since.is_empty());
    }

    #[tokio::test]
    async fn unhealthy_node_within_interval_requeues() {
        let since = Utc::now() - ChronoDuration::minutes(4);
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node()
            .returning(move |_| Ok(Some(node("False", Some(since)))));
        kube.expect_delete_instance().never();

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Managed)),
            context(kube, MockBackend::new()),
        )
        .await
        .unwrap();
        assert_ne!(action, Action::await_change());
    }

    /// A member that stays not-ready past the cleanup interval is deleted.
    #[tokio::test]
    async fn story_unhealthy_node_past_interval_is_remediated() {
        let since = Utc::now() - ChronoDuration::minutes(11);
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node()
            .returning(move |_| Ok(Some(node("Unknown", Some(since)))));
        kube.expect_delete_instance()
            .withf(|name| name == "pool-a-abcdefgh")
            .times(1)
            .returning(|_| Ok(()));

        let action = reconcile(
            Arc::new(sample_instance(InstancePhase::Managed)),
            context(kube, MockBackend::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn lost_node_deletes_instance() {
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node().returning(|_| Ok(None));
        kube.expect_delete_instance().times(1).returning(|_| Ok(()));

        reconcile(
            Arc::new(sample_instance(InstancePhase::Managed)),
            context(kube, MockBackend::new()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn terminating_node_deletes_instance() {
        let mut kube = MockInstanceKube::new();
        kube.expect_get_node().returning(|_| {
            let mut n = node("True", None);
            n.metadata.deletion_timestamp = Some(Time(Utc::now()));
            Ok(Some(n))
        });
        kube.expect_delete_instance().times(1).returning(|_| Ok(()));

        reconcile(
            Arc::new(sample_instance(InstancePhase::Managed)),
            context(kube, MockBackend::new()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn without_cleanup_interval_unhealthy_nodes_are_kept() {
        let mut instance = sample_instance(InstancePhase::Managed);
        instance.spec.node_cleanup_wait_interval = None;
        let since = Utc::now() - ChronoDuration::hours(5);

        let mut kube = MockInstanceKube::new();
        kube.expect_get_node()
            .returning(move |_| Ok(Some(node("False", Some(since)))));
        kube.expect_delete_instance().never();

        let action = reconcile(Arc::new(instance), context(kube, MockBackend::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Removal
    // =========================================================================

    fn deleting(phase: InstancePhase) -> Instance {
        let mut instance = sample_instance(phase);
        instance.metadata.deletion_timestamp = Some(Time(Utc::now()));
        instance
    }

    /// The device is deprovisioned before the finalizer is released.
    #[tokio::test]
    async fn story_removal_deprovisions_before_releasing_finalizer() {
        let order = StdArc::new(Mutex::new(Vec::new()));

        let mut backend = MockBackend::new();
        let o = order.clone();
        backend
            .expect_delete()
            .withf(|_, id| id == "d1")
            .times(1)
            .returning(move |_, _| {
                o.lock().unwrap().push("device");
                Ok(())
            });

        let mut kube = MockInstanceKube::new();
        let o = order.clone();
        kube.expect_delete_node().times(1).returning(move |_| {
            o.lock().unwrap().push("node");
            Ok(())
        });
        let o = order.clone();
        kube.expect_remove_finalizer().times(1).returning(move |_| {
            o.lock().unwrap().push("finalizer");
            Ok(())
        });

        reconcile(
            Arc::new(deleting(InstancePhase::Managed)),
            context(kube, backend),
        )
        .await
        .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["device", "node", "finalizer"]);
    }

    #[tokio::test]
    async fn failed_deprovision_keeps_finalizer() {
        let mut backend = MockBackend::new();
        backend.expect_delete().returning(|_, _| {
            Err(Error::provisioning_for("d1", "metal API returned 500"))
        });
        let mut kube = MockInstanceKube::new();
        kube.expect_remove_finalizer().never();
        kube.expect_delete_node().never();

        let result = reconcile(
            Arc::new(deleting(InstancePhase::Ready)),
            context(kube, backend),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn removal_without_device_skips_backend() {
        let mut backend = MockBackend::new();
        backend.expect_delete().never();
        let mut kube = MockInstanceKube::new();
        kube.expect_delete_node().times(1).returning(|_| Ok(()));
        kube.expect_remove_finalizer().times(1).returning(|_| Ok(()));

        reconcile(
            Arc::new(deleting(InstancePhase::Empty)),
            context(kube, backend),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn removal_after_finalizer_released_is_noop() {
        let mut instance = deleting(InstancePhase::Managed);
        instance.metadata.finalizers = None;

        let mut backend = MockBackend::new();
        backend.expect_delete().never();
        let mut kube = MockInstanceKube::new();
        kube.expect_remove_finalizer().never();

        let action = reconcile(Arc::new(instance), context(kube, backend))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn success_resets_backoff() {
        let ctx = context(MockInstanceKube::new(), MockBackend::new());
        let instance = Arc::new(sample_instance(InstancePhase::Empty));
        let err = Error::provisioning_for("pool-a-abcdefgh", "timeout");
        error_policy(instance.clone(), &err, ctx.clone());
        error_policy(instance.clone(), &err, ctx.clone());
        assert_eq!(ctx.backoff.failures("pool-a-abcdefgh"), 2);
        ctx.backoff.reset("pool-a-abcdefgh");
        assert_eq!(
            error_policy(instance, &err, ctx),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
