//! Error types for the Synapse operator

use std::time::Duration;

use thiserror::Error;

use crate::controller::HomeserverConfigError;

/// Backoff applied when a user-referenced object is missing or malformed.
pub const PRECONDITION_REQUEUE: Duration = Duration::from_secs(30);

/// Backoff applied while the managed PostgreSQL cluster is starting.
pub const DATABASE_NOT_READY_REQUEUE: Duration = Duration::from_secs(5);

/// Floor for "immediate" requeues so a failing pass never spins the scheduler.
const IMMEDIATE_REQUEUE: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("ConfigMap {name} does not exist in namespace {namespace}")]
    ConfigMapMissing { name: String, namespace: String },

    #[error("Invalid {document} in ConfigMap {config_map}: {source}")]
    ConfigDocument {
        config_map: String,
        document: &'static str,
        #[source]
        source: HomeserverConfigError,
    },

    #[error("Missing {key} in PostgreSQL Secret {secret}")]
    SecretKeyMissing { secret: String, key: &'static str },

    #[error("Service {0} has no cluster IP yet")]
    ServiceIpMissing(String),

    #[error("Cannot build owner reference for {0}: object has no uid")]
    MissingOwnerReference(String),

    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Classify an editor failure on `document` in ConfigMap `config_map`.
    ///
    /// Rendering failures are ours, not the user's, and keep the immediate
    /// requeue of a serialization error.
    pub fn config_document(
        config_map: impl Into<String>,
        document: &'static str,
        source: HomeserverConfigError,
    ) -> Self {
        match source {
            HomeserverConfigError::Render { source, .. } => Error::YamlError(source),
            source => Error::ConfigDocument {
                config_map: config_map.into(),
                document,
                source,
            },
        }
    }

    /// Whether the error comes from talking to the API server rather than
    /// from the state of the user's objects.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::KubeError(_) | Error::ServiceIpMissing(_))
    }

    /// True when the API server rejected a write because the object changed
    /// since it was read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// Delay before the next pass for the same key.
    pub fn requeue_after(&self) -> Duration {
        match self {
            Error::ConfigMapMissing { .. }
            | Error::ConfigDocument { .. }
            | Error::SecretKeyMissing { .. } => PRECONDITION_REQUEUE,
            _ => IMMEDIATE_REQUEUE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml_error() -> serde_yaml::Error {
        serde_yaml::from_str::<serde_yaml::Value>("key: [unterminated").unwrap_err()
    }

    #[test]
    fn test_user_document_errors_use_precondition_backoff() {
        let err = Error::config_document(
            "my-bridge",
            "heisenbridge.yaml",
            HomeserverConfigError::MissingDocument("heisenbridge.yaml"),
        );
        assert!(matches!(err, Error::ConfigDocument { .. }));
        assert_eq!(err.requeue_after(), PRECONDITION_REQUEUE);
        assert_eq!(
            err.to_string(),
            "Invalid heisenbridge.yaml in ConfigMap my-bridge: missing heisenbridge.yaml in ConfigMap"
        );
    }

    #[test]
    fn test_render_errors_are_serialization_errors() {
        let err = Error::config_document(
            "my-synapse",
            "homeserver.yaml",
            HomeserverConfigError::Render {
                document: "homeserver.yaml",
                source: yaml_error(),
            },
        );
        assert!(matches!(err, Error::YamlError(_)));
        assert_eq!(err.requeue_after(), IMMEDIATE_REQUEUE);
    }
}
