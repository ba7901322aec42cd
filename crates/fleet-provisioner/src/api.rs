//! Raw calls against the metal provisioning API
//!
//! [`MetalApi`] is one method per endpoint the operator uses. [`MetalClient`]
//! implements it over HTTPS with `reqwest`, authenticating every request with
//! the `X-Auth-Token` header. Higher level sequencing lives in
//! [`crate::provisioner`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::ProvisionerError;
use crate::types::{
    AddressRequest, Device, DeviceCreateRequest, DeviceList, DeviceUpdateRequest, Port,
    ReinstallRequest,
};

/// Header carrying the API token
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Devices requested per listing page
const PAGE_SIZE: u32 = 100;

/// Upper bound on listing pages followed in one call
const MAX_PAGES: u32 = 50;

/// Endpoints of the provisioning API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetalApi: Send + Sync {
    /// Create a device in `project_id`
    async fn create_device(
        &self,
        project_id: &str,
        request: &DeviceCreateRequest,
    ) -> Result<Device, ProvisionerError>;

    /// Fetch a device, `None` when it does not exist
    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, ProvisionerError>;

    /// List every device of `project_id`
    async fn list_devices(&self, project_id: &str) -> Result<Vec<Device>, ProvisionerError>;

    /// Update boot settings of a device
    async fn update_device(
        &self,
        device_id: &str,
        request: &DeviceUpdateRequest,
    ) -> Result<Device, ProvisionerError>;

    /// Trigger a device action such as a reinstall
    async fn reinstall_device(
        &self,
        device_id: &str,
        request: &ReinstallRequest,
    ) -> Result<(), ProvisionerError>;

    /// Delete a device; a missing device is reported as not found
    async fn delete_device(&self, device_id: &str) -> Result<(), ProvisionerError>;

    /// Add a port to its bond
    async fn bond_port(&self, port_id: &str) -> Result<Port, ProvisionerError>;

    /// Remove a port from its bond
    async fn disbond_port(&self, port_id: &str) -> Result<Port, ProvisionerError>;

    /// Switch a port to layer 2
    async fn convert_layer2(&self, port_id: &str) -> Result<Port, ProvisionerError>;

    /// Switch a port to layer 3 requesting the given address families
    async fn convert_layer3(
        &self,
        port_id: &str,
        addresses: &[AddressRequest],
    ) -> Result<Port, ProvisionerError>;

    /// Attach a virtual network to a port
    async fn assign_vlan(&self, port_id: &str, vnid: &str) -> Result<Port, ProvisionerError>;
}

/// `reqwest` implementation of [`MetalApi`]
#[derive(Clone)]
pub struct MetalClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for MetalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetalClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Build the shared HTTP client used by every [`MetalClient`]
pub fn http_client() -> Result<reqwest::Client, ProvisionerError> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("fleet-operator/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

#[derive(Deserialize)]
struct ApiErrors {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

impl MetalClient {
    /// Create a client for `base_url` acting with `token`
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "metal API request");
        self.http
            .request(method, url)
            .header(AUTH_HEADER, &self.token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ProvisionerError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrors>(&body)
            .ok()
            .and_then(|e| {
                if e.errors.is_empty() {
                    e.error
                } else {
                    Some(e.errors.join("; "))
                }
            })
            .unwrap_or(body);
        Err(ProvisionerError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ProvisionerError> {
        Ok(self.send(request).await?.json().await?)
    }

    async fn port_action<B: serde::Serialize + Sync>(
        &self,
        port_id: &str,
        action: &str,
        body: &B,
    ) -> Result<Port, ProvisionerError> {
        let request = self
            .request(Method::POST, &format!("/ports/{port_id}/{action}"))
            .json(body);
        self.send_json(request).await
    }
}

#[async_trait]
impl MetalApi for MetalClient {
    async fn create_device(
        &self,
        project_id: &str,
        request: &DeviceCreateRequest,
    ) -> Result<Device, ProvisionerError> {
        let request = self
            .request(Method::POST, &format!("/projects/{project_id}/devices"))
            .json(request);
        self.send_json(request).await
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, ProvisionerError> {
        let request = self.request(Method::GET, &format!("/devices/{device_id}"));
        match self.send_json(request).await {
            Ok(device) => Ok(Some(device)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_devices(&self, project_id: &str) -> Result<Vec<Device>, ProvisionerError> {
        let mut devices = Vec::new();
        for page in 1..=MAX_PAGES {
            let request = self
                .request(Method::GET, &format!("/projects/{project_id}/devices"))
                .query(&[("page", page), ("per_page", PAGE_SIZE)]);
            let list: DeviceList = self.send_json(request).await?;
            let last = list.meta.next.is_none() || list.devices.is_empty();
            devices.extend(list.devices);
            if last {
                break;
            }
        }
        Ok(devices)
    }

    async fn update_device(
        &self,
        device_id: &str,
        request: &DeviceUpdateRequest,
    ) -> Result<Device, ProvisionerError> {
        let request = self
            .request(Method::PUT, &format!("/devices/{device_id}"))
            .json(request);
        self.send_json(request).await
    }

    async fn reinstall_device(
        &self,
        device_id: &str,
        request: &ReinstallRequest,
    ) -> Result<(), ProvisionerError> {
        let request = self
            .request(Method::POST, &format!("/devices/{device_id}/actions"))
            .json(request);
        self.send(request).await.map(|_| ())
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), ProvisionerError> {
        let request = self
            .request(Method::DELETE, &format!("/devices/{device_id}"))
            .query(&[("force_delete", true)]);
        match self.send(request).await {
            Ok(_) => Ok(()),
            Err(ProvisionerError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(ProvisionerError::NotFound {
                    what: format!("device {device_id}"),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn bond_port(&self, port_id: &str) -> Result<Port, ProvisionerError> {
        self.port_action(port_id, "bond", &serde_json::json!({ "bulk_enable": false }))
            .await
    }

    async fn disbond_port(&self, port_id: &str) -> Result<Port, ProvisionerError> {
        self.port_action(port_id, "disbond", &serde_json::json!({ "bulk_disable": false }))
            .await
    }

    async fn convert_layer2(&self, port_id: &str) -> Result<Port, ProvisionerError> {
        self.port_action(port_id, "convert/layer-2", &serde_json::json!({}))
            .await
    }

    async fn convert_layer3(
        &self,
        port_id: &str,
        addresses: &[AddressRequest],
    ) -> Result<Port, ProvisionerError> {
        self.port_action(
            port_id,
            "convert/layer-3",
            &serde_json::json!({ "request_ips": addresses }),
        )
        .await
    }

    async fn assign_vlan(&self, port_id: &str, vnid: &str) -> Result<Port, ProvisionerError> {
        self.port_action(port_id, "assign", &serde_json::json!({ "vnid": vnid }))
            .await
    }
}
