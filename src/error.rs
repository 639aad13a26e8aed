//! Error types for the Checkly operator

use std::fmt;

use thiserror::Error;

use crate::checkly::ApiError;
use crate::crd::SpecValidationError;

/// Stage of a reconcile invocation in which an external call failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Creating,
    Reading,
    Updating,
    Deleting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Creating => "creating",
            Stage::Reading => "reading",
            Stage::Updating => "updating",
            Stage::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid operator configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid resource spec; terminal for the current generation
    #[error("Validation error: {0}")]
    ValidationError(#[from] SpecValidationError),

    /// Checkly API call failed
    #[error("Checkly API error while {stage}: {source}")]
    Checkly {
        stage: Stage,
        #[source]
        source: ApiError,
    },

    /// Stale resourceVersion on a cluster write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A referenced resource has not been synced yet
    #[error("Waiting for dependency: {0}")]
    DependencyPending(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn checkly(stage: Stage, source: ApiError) -> Self {
        Error::Checkly { stage, source }
    }

    /// Whether the controller should retry with backoff
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::HttpError(_) | Error::DependencyPending(_) => true,
            Error::Conflict(_) => true,
            Error::Checkly { source, .. } => source.is_retriable(),
            Error::ConfigError(_) | Error::ValidationError(_) | Error::SerializationError(_) => {
                false
            }
        }
    }

    /// Machine-readable reason used for conditions and metrics labels
    pub fn reason(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "KubeError",
            Error::ConfigError(_) => "ConfigError",
            Error::ValidationError(_) => "InvalidSpec",
            Error::Checkly { source, .. } => source.reason(),
            Error::Conflict(_) => "Conflict",
            Error::DependencyPending(_) => "DependencyPending",
            Error::SerializationError(_) => "SerializationError",
            Error::HttpError(_) => "Transient",
        }
    }

    /// Map a kube error to `Conflict` when the API server rejected a stale write
    pub fn from_kube_write(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(resp.message),
            other => Error::KubeError(other),
        }
    }
}
