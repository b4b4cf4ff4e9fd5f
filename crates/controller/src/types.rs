//! Shared types for the canary control plane: crate-wide error enum and
//! result alias.

use crate::applier::ApplyError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("GitHub API error: {0}")]
    GitHubError(#[from] octocrab::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Event is not newer than the registry's record for the same canary.
    /// Ignored and logged, never retried.
    #[error("stale event for canary {id} (revision {revision})")]
    StaleEvent { id: u64, revision: String },

    /// Desired state is malformed. Permanent until a new revision arrives.
    #[error("invalid desired state for canary {id}: {reason}")]
    ValidationError { id: u64, reason: String },

    #[error("resource apply failed: {0}")]
    ApplyError(#[from] ApplyError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
