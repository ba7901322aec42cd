//! Domain-level provisioning operations
//!
//! [`Provisioner`] is what the Instance controller talks to: it speaks in
//! Instances and device status, takes the credentials to act with on every
//! call and reports failures as [`fleet_common::Error`]. [`MetalProvisioner`]
//! implements it by sequencing raw [`MetalApi`] calls.

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use fleet_common::cloud_init::BootConfig;
use fleet_common::config::DEFAULT_INTERFACE;
use fleet_common::crd::Instance;
use fleet_common::{Error, MetalCredentials};
use kube::ResourceExt;

use crate::api::{http_client, MetalApi, MetalClient};
use crate::error::ProvisionerError;
use crate::topology::{plan_conversion, PortAction};
use crate::types::{Device, DeviceCreateRequest, DeviceState, DeviceUpdateRequest, ReinstallRequest};

/// Observed state of a device
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceStatus {
    /// Device identifier
    pub id: String,
    /// Backend lifecycle state
    pub state: DeviceState,
    /// First public IPv4 address
    pub public_ipv4: Option<String>,
    /// First private IPv4 address
    pub private_ipv4: Option<String>,
}

impl From<&Device> for DeviceStatus {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            state: device.device_state(),
            public_ipv4: device.public_ipv4(),
            private_ipv4: device.private_ipv4(),
        }
    }
}

/// Device lifecycle operations used by the Instance controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Request a new device for `instance`
    ///
    /// Not idempotent: every call creates a device. Callers record the
    /// returned id before calling again.
    async fn create(
        &self,
        credentials: &MetalCredentials,
        instance: &Instance,
    ) -> Result<DeviceStatus, Error>;

    /// Current state of a device, `None` when it no longer exists
    async fn status(
        &self,
        credentials: &MetalCredentials,
        device_id: &str,
    ) -> Result<Option<DeviceStatus>, Error>;

    /// Device in the credentials' project whose hostname is `hostname`
    async fn find_by_hostname(
        &self,
        credentials: &MetalCredentials,
        hostname: &str,
    ) -> Result<Option<DeviceStatus>, Error>;

    /// Convert the network topology, install the final boot configuration and
    /// reinstall the device keeping its data
    async fn reconfigure(
        &self,
        credentials: &MetalCredentials,
        instance: &Instance,
    ) -> Result<(), Error>;

    /// Deprovision a device; an absent device counts as deleted
    async fn delete(&self, credentials: &MetalCredentials, device_id: &str) -> Result<(), Error>;
}

/// [`Provisioner`] backed by the metal REST API
#[derive(Clone, Debug)]
pub struct MetalProvisioner {
    http: reqwest::Client,
    base_url: String,
    default_ipxe_url: String,
}

impl MetalProvisioner {
    /// Create a provisioner for the API at `base_url`
    ///
    /// `default_ipxe_url` is the reinstall boot script for Instances that do
    /// not carry their own.
    pub fn new(
        base_url: impl Into<String>,
        default_ipxe_url: impl Into<String>,
    ) -> Result<Self, Error> {
        let http = http_client().map_err(|e| {
            Error::configuration("metal-api", format!("cannot build HTTP client: {e}"))
        })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            default_ipxe_url: default_ipxe_url.into(),
        })
    }

    fn client(&self, credentials: &MetalCredentials) -> MetalClient {
        MetalClient::new(self.http.clone(), self.base_url.clone(), credentials.token.clone())
    }
}

#[async_trait]
impl Provisioner for MetalProvisioner {
    async fn create(
        &self,
        credentials: &MetalCredentials,
        instance: &Instance,
    ) -> Result<DeviceStatus, Error> {
        create_device(&self.client(credentials), credentials, instance)
            .await
            .map_err(|e| e.for_resource(&instance.name_any()))
    }

    async fn status(
        &self,
        credentials: &MetalCredentials,
        device_id: &str,
    ) -> Result<Option<DeviceStatus>, Error> {
        self.client(credentials)
            .get_device(device_id)
            .await
            .map(|d| d.as_ref().map(DeviceStatus::from))
            .map_err(|e| e.for_resource(device_id))
    }

    async fn find_by_hostname(
        &self,
        credentials: &MetalCredentials,
        hostname: &str,
    ) -> Result<Option<DeviceStatus>, Error> {
        find_device_by_hostname(&self.client(credentials), &credentials.project_id, hostname)
            .await
            .map(|d| d.as_ref().map(DeviceStatus::from))
            .map_err(|e| e.for_resource(hostname))
    }

    async fn reconfigure(
        &self,
        credentials: &MetalCredentials,
        instance: &Instance,
    ) -> Result<(), Error> {
        reconfigure_device(&self.client(credentials), instance, &self.default_ipxe_url)
            .await
            .map_err(|e| e.for_resource(&instance.name_any()))
    }

    async fn delete(&self, credentials: &MetalCredentials, device_id: &str) -> Result<(), Error> {
        delete_device(&self.client(credentials), device_id)
            .await
            .map_err(|e| e.for_resource(device_id))
    }
}

/// Creation request for `instance`, falling back to the credentials' project
pub fn device_create_request(instance: &Instance) -> DeviceCreateRequest {
    let spec = &instance.spec;
    DeviceCreateRequest {
        hostname: instance.name_any(),
        plan: spec.plan.clone(),
        facility: spec.facility.clone(),
        metro: spec.metro.clone(),
        operating_system: spec.operating_system.clone(),
        billing_cycle: spec.billing_cycle.clone(),
        userdata: spec.userdata.clone(),
        tags: spec.tags.clone(),
        description: spec.description.clone(),
        ipxe_script_url: spec.ipxe_script_url.clone(),
        public_ipv4_subnet_size: spec.public_ipv4_subnet_size,
        always_pxe: spec.always_pxe,
        hardware_reservation_id: spec.hardware_reservation_id.clone(),
        spot_instance: spec.spot_instance,
        spot_price_max: spec.spot_price_max,
        custom_data: spec.custom_data.clone(),
        user_ssh_keys: spec.user_ssh_keys.clone(),
        project_ssh_keys: spec.project_ssh_keys.clone(),
        features: spec.features.clone(),
        no_ssh_keys: spec.no_ssh_keys,
    }
}

/// Create the device for `instance`
pub async fn create_device(
    api: &dyn MetalApi,
    credentials: &MetalCredentials,
    instance: &Instance,
) -> Result<DeviceStatus, ProvisionerError> {
    let project_id = instance
        .spec
        .project_id
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or(&credentials.project_id);
    let request = device_create_request(instance);
    let device = api.create_device(project_id, &request).await?;
    info!(
        instance = %request.hostname,
        device = %device.id,
        state = %device.state,
        "device created"
    );
    Ok(DeviceStatus::from(&device))
}

/// Device of `project_id` named `hostname`
///
/// When several devices share the hostname the first one the backend lists
/// is returned.
pub async fn find_device_by_hostname(
    api: &dyn MetalApi,
    project_id: &str,
    hostname: &str,
) -> Result<Option<Device>, ProvisionerError> {
    let mut matches = api
        .list_devices(project_id)
        .await?
        .into_iter()
        .filter(|d| d.hostname == hostname);
    let found = matches.next();
    if matches.next().is_some() {
        warn!(hostname, "more than one device shares this hostname");
    }
    Ok(found)
}

/// Delete a device, treating "not found" as success
pub async fn delete_device(api: &dyn MetalApi, device_id: &str) -> Result<(), ProvisionerError> {
    match api.delete_device(device_id).await {
        Ok(()) => {
            info!(device = %device_id, "device deleted");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(device = %device_id, "device already absent");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Reconfigure and reinstall the device of `instance`
///
/// Steps, each skipped when the device already reflects it:
/// 1. Convert the port topology and assign VLANs
/// 2. Point the boot script at the reinstall script and write the boot
///    configuration with the management network
/// 3. Reinstall preserving data
pub async fn reconfigure_device(
    api: &dyn MetalApi,
    instance: &Instance,
    default_ipxe_url: &str,
) -> Result<(), ProvisionerError> {
    let name = instance.name_any();
    let device_id = instance.device_id().ok_or_else(|| ProvisionerError::NotFound {
        what: format!("device id of instance {name}"),
    })?;
    let device = api
        .get_device(device_id)
        .await?
        .ok_or_else(|| ProvisionerError::NotFound {
            what: format!("device {device_id}"),
        })?;

    if let Some(networking) = instance
        .spec
        .networking_configuration
        .as_ref()
        .filter(|n| !n.is_empty())
    {
        let plan = plan_conversion(&device, networking)?;
        info!(
            instance = %name,
            network_type = %networking.network_type,
            steps = plan.len(),
            "converting network topology"
        );
        for action in &plan {
            apply_port_action(api, action).await?;
        }
    }

    let macs = management_macs(instance, &device)?;
    let mut boot = BootConfig::parse(instance.spec.userdata.as_deref().unwrap_or_default())
        .map_err(|e| ProvisionerError::BootConfig(e.to_string()))?;
    boot.set_management_network(&macs, &instance.spec.management_bonding_options);
    let userdata = boot
        .render()
        .map_err(|e| ProvisionerError::BootConfig(e.to_string()))?;

    let ipxe_url = instance.reinstall_ipxe_url().unwrap_or(default_ipxe_url);
    let update = DeviceUpdateRequest {
        ipxe_script_url: (device.ipxe_script_url.as_deref() != Some(ipxe_url))
            .then(|| ipxe_url.to_string()),
        userdata: (device.userdata.as_deref() != Some(userdata.as_str())).then_some(userdata),
    };
    if update != DeviceUpdateRequest::default() {
        api.update_device(device_id, &update).await?;
        debug!(instance = %name, device = %device_id, "boot settings updated");
    }

    if device.device_state() == DeviceState::Reinstalling {
        debug!(instance = %name, device = %device_id, "reinstall already in progress");
        return Ok(());
    }
    api.reinstall_device(device_id, &ReinstallRequest::preserving_data())
        .await?;
    info!(instance = %name, device = %device_id, "reinstall requested");
    Ok(())
}

/// MAC addresses of the management interfaces, in the listed order
fn management_macs(instance: &Instance, device: &Device) -> Result<Vec<String>, ProvisionerError> {
    let defaults = [DEFAULT_INTERFACE.to_string()];
    let interfaces: &[String] = if instance.spec.management_interfaces.is_empty() {
        &defaults
    } else {
        &instance.spec.management_interfaces
    };

    interfaces
        .iter()
        .map(|name| {
            device
                .port(name)
                .and_then(|p| p.data.mac.clone())
                .ok_or_else(|| ProvisionerError::MissingPort {
                    device: device.id.clone(),
                    port: name.clone(),
                })
        })
        .collect()
}

async fn apply_port_action(api: &dyn MetalApi, action: &PortAction) -> Result<(), ProvisionerError> {
    debug!(port = %action.port_name(), ?action, "applying port action");
    match action {
        PortAction::Disbond { port_id, .. } => api.disbond_port(port_id).await?,
        PortAction::Bond { port_id, .. } => api.bond_port(port_id).await?,
        PortAction::ConvertLayer2 { port_id, .. } => api.convert_layer2(port_id).await?,
        PortAction::ConvertLayer3 {
            port_id, addresses, ..
        } => api.convert_layer3(port_id, addresses).await?,
        PortAction::AssignVlan { port_id, vnid, .. } => api.assign_vlan(port_id, vnid).await?,
    };
    Ok(())
}
