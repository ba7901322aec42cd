//! Provisioning API credentials
//!
//! The pool controller reads them from the operator secret and stamps them onto
//! every Instance it creates. The instance controller reads them back from the
//! Instance, so it never needs access to the secret itself.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;

use crate::crd::Instance;
use crate::Error;

/// Secret key holding the API token
pub const AUTH_TOKEN_KEY: &str = "METAL_AUTH_TOKEN";

/// Secret key holding the project identifier
pub const PROJECT_ID_KEY: &str = "PROJECT_ID";

/// API token and project the provisioning client acts on
#[derive(Clone, PartialEq, Eq)]
pub struct MetalCredentials {
    /// API token sent as `X-Auth-Token`
    pub token: String,
    /// Project devices are created in and listed from
    pub project_id: String,
}

impl std::fmt::Debug for MetalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetalCredentials")
            .field("token", &"<redacted>")
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl MetalCredentials {
    /// Create credentials from their parts
    pub fn new(token: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            project_id: project_id.into(),
        }
    }

    /// Load credentials from a secret's binary data
    ///
    /// Both keys are required. A missing key is a configuration error naming it.
    pub fn from_secret_data(
        secret_name: &str,
        data: Option<&BTreeMap<String, ByteString>>,
    ) -> crate::Result<Self> {
        let read = |key: &str| -> crate::Result<String> {
            let bytes = data.and_then(|d| d.get(key)).ok_or_else(|| {
                Error::configuration(
                    "credentials",
                    format!("secret {secret_name} does not contain a key {key}"),
                )
            })?;
            let value = String::from_utf8(bytes.0.clone()).map_err(|_| {
                Error::configuration(
                    "credentials",
                    format!("secret {secret_name} key {key} is not valid UTF-8"),
                )
            })?;
            Ok(value.trim().to_string())
        };
        Ok(Self {
            token: read(AUTH_TOKEN_KEY)?,
            project_id: read(PROJECT_ID_KEY)?,
        })
    }

    /// Load the credentials stamped onto an Instance by its pool
    pub fn from_instance(instance: &Instance) -> crate::Result<Self> {
        let name = instance.metadata.name.as_deref().unwrap_or_default();
        let token = instance.api_token().ok_or_else(|| {
            Error::configuration(
                "credentials",
                format!("instance {name} has no provisioning token annotation"),
            )
        })?;
        let project_id = instance
            .spec
            .project_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::configuration(
                    "credentials",
                    format!("instance {name} has no projectID"),
                )
            })?;
        Ok(Self::new(token, project_id))
    }
}
