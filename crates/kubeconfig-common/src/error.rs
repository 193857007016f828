//! Error types for the kubeconfig operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants line up with how a failed reconciliation pass is handled:
//! transient cluster failures are retried, input errors wait for a spec
//! change, and invariant violations need someone to fix upstream state.

use thiserror::Error;

use crate::kube_utils::is_conflict;
use crate::ttl::TtlParseError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kubeconfig operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid user input on a Kubeconfig spec
    #[error("validation error for {kubeconfig}: {message}")]
    Validation {
        /// Name of the Kubeconfig with invalid configuration
        kubeconfig: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.expirationTTL")
        field: Option<String>,
    },

    /// Token issuance failed
    #[error("token error for {principal}: {message}")]
    Token {
        /// Namespace/name of the ServiceAccount the token was requested for
        principal: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Persisted state contradicts what an earlier state guaranteed
    #[error("invariant violated for {kubeconfig}: {message}")]
    Invariant {
        /// Name of the Kubeconfig whose state is inconsistent
        kubeconfig: String,
        /// Description of the broken invariant
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "startup", "store")
        context: String,
    },
}

impl Error {
    /// Create a validation error with Kubeconfig context
    pub fn validation_for(kubeconfig: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            kubeconfig: kubeconfig.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with Kubeconfig context and field path
    pub fn validation_for_field(
        kubeconfig: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            kubeconfig: kubeconfig.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Wrap a TTL parse failure as a validation error on `spec.expirationTTL`
    pub fn invalid_ttl(kubeconfig: impl Into<String>, err: TtlParseError) -> Self {
        Self::validation_for_field(
            kubeconfig,
            "spec.expirationTTL",
            format!("failed to parse expirationTTL: {}", err),
        )
    }

    /// Create a token error for a ServiceAccount
    pub fn token(namespace: &str, service_account: &str, msg: impl Into<String>) -> Self {
        Self::Token {
            principal: format!("{}/{}", namespace, service_account),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an invariant violation for a Kubeconfig
    pub fn invariant(kubeconfig: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Invariant {
            kubeconfig: kubeconfig.into(),
            message: msg.into(),
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
    /// Retryable errors are requeued quickly. Everything else waits for a
    /// spec change or the slow resync.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                // Optimistic concurrency conflicts resolve on the next pass
                e if is_conflict(e) => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Token { .. } => true,
            Error::Serialization { .. } => false,
            Error::Invariant { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the Kubeconfig name if this error is associated with one
    pub fn kubeconfig(&self) -> Option<&str> {
        match self {
            Error::Validation { kubeconfig, .. } | Error::Invariant { kubeconfig, .. } => {
                if kubeconfig == UNKNOWN_CONTEXT {
                    None
                } else {
                    Some(kubeconfig)
                }
            }
            _ => None,
        }
    }

    /// Machine-readable reason used on failed conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::Validation { .. } => "InvalidSpec",
            Error::Token { .. } => "TokenRequestFailed",
            Error::Serialization { .. } => "SerializationFailed",
            Error::Invariant { .. } => "InvariantViolated",
            Error::Internal { .. } => "InternalError",
        }
    }
}
