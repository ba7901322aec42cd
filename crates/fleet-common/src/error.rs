//! Error types for the fleet operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the resource it concerns where one is known, so a
//! failed reconciliation pass can be traced back to a specific Instance or
//! InstancePool from the logs alone.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fleet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.networkingConfiguration.type")
        field: Option<String>,
    },

    /// Provisioning backend error
    #[error("provisioning error for {resource}: {message}")]
    Provisioning {
        /// Name of the Instance being provisioned
        resource: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Operator configuration error (missing secret keys, unreadable bootstrap document)
    #[error("configuration error [{context}]: {message}")]
    Configuration {
        /// Description of what is missing or malformed
        message: String,
        /// Where the configuration was read from (e.g., "credentials", "join-token")
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provisioning error for an Instance
    pub fn provisioning_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            resource: resource.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provisioning error (e.g., rejected template)
    pub fn provisioning_permanent(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provisioning {
            resource: resource.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a configuration error with context
    pub fn configuration(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and serialization errors need an operator to
    /// fix something before a retry can succeed. The error policy still
    /// requeues them with backoff; this flag only decides how loudly they are
    /// reported.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Provisioning { retryable, .. } => *retryable,
            Error::Configuration { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Provisioning { resource, .. } => Some(resource),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization_for_kind("json", e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization_for_kind("yaml", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a pool without credentials fails its pass but is not retried
    /// as if it were a transient fault.
    #[test]
    fn story_missing_credentials_are_not_retryable() {
        let err = Error::configuration("credentials", "secret has no key PROJECT_ID");
        assert!(err.to_string().contains("[credentials]"));
        assert!(err.to_string().contains("PROJECT_ID"));
        assert!(!err.is_retryable());
        assert_eq!(err.context(), Some("credentials"));
    }

    /// Story: a quota rejection from the backend is retried, an invalid plan is not
    #[test]
    fn story_provisioning_errors_carry_retryability() {
        let quota = Error::provisioning_for("pool-a-abcdefgh", "quota exceeded");
        assert!(quota.is_retryable());
        assert_eq!(quota.resource(), Some("pool-a-abcdefgh"));

        let invalid = Error::provisioning_permanent("pool-a-abcdefgh", "unknown plan");
        assert!(!invalid.is_retryable());
        assert!(invalid.to_string().contains("unknown plan"));
    }

    #[test]
    fn validation_with_field_path() {
        let err = Error::validation_for_field(
            "pool-a",
            "spec.networkingConfiguration.type",
            "unknown network type 'layer4'",
        );
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.networkingConfiguration.type"));
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert_eq!(err.context(), Some(UNKNOWN_CONTEXT));
        assert!(err.to_string().contains("[unknown]"));
        assert!(err.is_retryable());
    }

    #[test]
    fn serialization_errors_convert_from_serde() {
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>("a: [").unwrap_err();
        let err: Error = yaml_err.into();
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("yaml")),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }
}
