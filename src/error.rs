//! Error types for the AppService operator

use thiserror::Error;

/// Result alias used throughout the operator
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the reconciler, the resource store and the admission server
#[derive(Error, Debug)]
pub enum Error {
    /// Transport or API failure talking to the Kubernetes API server
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Optimistic concurrency violation on an update or patch
    #[error("Conflict writing {kind} {name}: resource was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    /// The last-applied spec annotation could not be parsed
    #[error("Malformed spec snapshot on AppService {name}: {source}")]
    MalformedSnapshot {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// A child that must exist on the update path is gone
    #[error("{kind} {namespace}/{name} is missing while its Deployment exists")]
    MissingChild {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Webhook error: {0}")]
    WebhookError(String),
}

impl Error {
    /// Whether a retry with a short backoff can be expected to succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::Conflict { .. } | Error::MalformedSnapshot { .. }
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Conflict { .. } => "conflict",
            Error::MalformedSnapshot { .. } => "malformed_snapshot",
            Error::MissingChild { .. } => "missing_child",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::WebhookError(_) => "webhook",
        }
    }
}
