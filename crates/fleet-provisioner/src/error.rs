//! Errors raised by the provisioning client

use thiserror::Error;

/// Error talking to the provisioning backend
#[derive(Debug, Error)]
pub enum ProvisionerError {
    /// Transport failure (connection, timeout, TLS)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("metal API returned {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error text from the response body
        message: String,
    },

    /// The addressed object does not exist
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing object
        what: String,
    },

    /// The requested topology is not one the client knows how to build
    #[error("unknown network type '{0}'")]
    UnknownNetworkType(String),

    /// A port named in the configuration is absent from the device
    #[error("device {device} has no port named {port}")]
    MissingPort {
        /// Device identifier
        device: String,
        /// Port name
        port: String,
    },

    /// The boot configuration could not be rewritten
    #[error("boot configuration: {0}")]
    BootConfig(String),
}

impl ProvisionerError {
    /// True for "object does not exist" failures
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. }) || matches!(self, Self::Api { status: 404, .. })
    }

    /// Whether retrying the same request can succeed
    ///
    /// Rate limiting and server errors are transient; other client errors
    /// mean the request itself is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound { .. } => true,
            Self::UnknownNetworkType(_) | Self::MissingPort { .. } | Self::BootConfig(_) => false,
        }
    }

    /// Convert into the operator error type for the Instance `resource`
    pub fn for_resource(self, resource: &str) -> fleet_common::Error {
        match self {
            Self::UnknownNetworkType(_) => fleet_common::Error::validation_for_field(
                resource,
                "spec.networkingConfiguration.type",
                self.to_string(),
            ),
            Self::BootConfig(_) => fleet_common::Error::validation_for_field(
                resource,
                "spec.userdata",
                self.to_string(),
            ),
            other if other.is_retryable() => {
                fleet_common::Error::provisioning_for(resource, other.to_string())
            }
            other => fleet_common::Error::provisioning_permanent(resource, other.to_string()),
        }
    }
}
