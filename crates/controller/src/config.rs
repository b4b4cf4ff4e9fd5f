//! Canary controller configuration.
//!
//! Loaded from a mounted YAML file (Helm renders it into a ConfigMap).
//! Backoff bounds and the poll interval are operational tuning parameters,
//! not part of the correctness contract; any positive finite value works.

use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Main controller configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// GitHub repository the PR lifecycle feed watches
    pub github: GitHubConfig,

    /// Signal delivery configuration
    #[serde(default)]
    pub signal: SignalConfig,

    /// Reconciliation loop tuning
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Routing rule construction
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Canary environment resource shape
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// Repository in `owner/repo` form
    pub repository: String,

    /// Environment variable holding the API token
    #[serde(default = "default_token_env", rename = "tokenEnv")]
    pub token_env: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            repository: String::new(),
            token_env: default_token_env(),
        }
    }
}

impl GitHubConfig {
    /// Splits `repository` into (owner, repo).
    pub fn owner_repo(&self) -> Result<(String, String)> {
        match self.repository.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
                Ok((owner.to_string(), repo.to_string()))
            }
            _ => Err(Error::ConfigError(format!(
                "github.repository must be owner/repo, got '{}'",
                self.repository
            ))),
        }
    }
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

/// How PR lifecycle events reach the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalMode {
    /// Periodic full listing, diffed locally
    Poll,
    /// GitHub webhook push delivery
    Webhook,
    /// Webhook plus a slow poll as a safety net
    Both,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignalConfig {
    #[serde(default = "default_signal_mode")]
    pub mode: SignalMode,

    /// Poll interval in seconds (poll and both modes)
    #[serde(default = "default_poll_interval", rename = "pollIntervalSeconds")]
    pub poll_interval_seconds: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            mode: default_signal_mode(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

impl SignalConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

fn default_signal_mode() -> SignalMode {
    SignalMode::Poll
}

fn default_poll_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    /// Backoff base in milliseconds
    #[serde(default = "default_backoff_base", rename = "backoffBaseMs")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_backoff_max", rename = "backoffMaxMs")]
    pub backoff_max_ms: u64,

    /// Deadline for each resource applier call, in seconds
    #[serde(default = "default_applier_deadline", rename = "applierDeadlineSeconds")]
    pub applier_deadline_seconds: u64,

    /// Upper bound on concurrently reconciling environments
    #[serde(default = "default_max_concurrent", rename = "maxConcurrent")]
    pub max_concurrent: usize,

    /// Consecutive transient failures before an environment is reported
    /// Degraded (retries continue regardless)
    #[serde(default = "default_degraded_threshold", rename = "degradedThreshold")]
    pub degraded_threshold: u32,

    /// Checkpointing of applied state, for prune resume across restarts
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            applier_deadline_seconds: default_applier_deadline(),
            max_concurrent: default_max_concurrent(),
            degraded_threshold: default_degraded_threshold(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl ReconcileConfig {
    #[must_use]
    pub fn applier_deadline(&self) -> Duration {
        Duration::from_secs(self.applier_deadline_seconds)
    }
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_applier_deadline() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    8
}

fn default_degraded_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,

    /// Name of the ConfigMap holding the checkpoint
    #[serde(default = "default_checkpoint_name", rename = "configMap")]
    pub config_map: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_checkpoint_enabled(),
            config_map: default_checkpoint_name(),
        }
    }
}

fn default_checkpoint_enabled() -> bool {
    true
}

fn default_checkpoint_name() -> String {
    "canary-controller-state".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Logical services fronted by the routing layer
    #[serde(default)]
    pub services: Vec<String>,

    /// Namespace serving untagged (stable) traffic
    #[serde(default = "default_stable_namespace", rename = "stableNamespace")]
    pub stable_namespace: String,

    /// Prefix for canary environment namespaces, e.g. `pr-` -> `pr-42`
    #[serde(default = "default_namespace_prefix", rename = "namespacePrefix")]
    pub namespace_prefix: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            stable_namespace: default_stable_namespace(),
            namespace_prefix: default_namespace_prefix(),
        }
    }
}

fn default_stable_namespace() -> String {
    "default".to_string()
}

fn default_namespace_prefix() -> String {
    "pr-".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvironmentConfig {
    /// Image registry prefix; workloads run `{registry}/{service}:{revision}`
    #[serde(default = "default_registry")]
    pub registry: String,

    /// Replicas per canary workload
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            replicas: default_replicas(),
        }
    }
}

fn default_registry() -> String {
    "ghcr.io/5dlabs".to_string()
}

fn default_replicas() -> i32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address", rename = "bindAddress")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl ControllerConfig {
    /// Load configuration from the mounted YAML file.
    pub fn from_mounted_file(path: &str) -> Result<Self> {
        debug!("Loading controller configuration from {}", path);
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Validates the configuration before the controller starts.
    pub fn validate(&self) -> Result<()> {
        self.github.owner_repo()?;

        if self.routing.services.is_empty() {
            return Err(Error::ConfigError(
                "routing.services must name at least one logical service".to_string(),
            ));
        }
        if self.routing.namespace_prefix.is_empty() {
            return Err(Error::ConfigError(
                "routing.namespacePrefix must not be empty".to_string(),
            ));
        }
        if self.reconcile.backoff_base_ms == 0 || self.reconcile.backoff_max_ms == 0 {
            return Err(Error::ConfigError(
                "reconcile backoff bounds must be positive".to_string(),
            ));
        }
        if self.reconcile.backoff_base_ms > self.reconcile.backoff_max_ms {
            return Err(Error::ConfigError(
                "reconcile.backoffBaseMs must not exceed backoffMaxMs".to_string(),
            ));
        }
        if self.reconcile.max_concurrent == 0 {
            return Err(Error::ConfigError(
                "reconcile.maxConcurrent must be positive".to_string(),
            ));
        }
        if self.signal.poll_interval_seconds == 0 {
            return Err(Error::ConfigError(
                "signal.pollIntervalSeconds must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.github.repository = "5dlabs/shop".to_string();
        config.routing.services = vec!["backend".to_string()];
        config
    }

    #[test]
    fn parses_mounted_yaml_with_defaults() {
        let yaml = r#"
github:
  repository: 5dlabs/shop
signal:
  mode: webhook
routing:
  services: [backend, gateway]
  stableNamespace: prod
"#;
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.github.repository, "5dlabs/shop");
        assert_eq!(config.signal.mode, SignalMode::Webhook);
        assert_eq!(config.routing.stable_namespace, "prod");
        // untouched sections fall back to defaults
        assert_eq!(config.reconcile.backoff_base_ms, 500);
        assert_eq!(config.signal.poll_interval_seconds, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_repository() {
        let mut config = valid_config();
        config.github.repository = "not-a-repo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_services_and_zero_bounds() {
        let mut config = valid_config();
        config.routing.services.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.reconcile.backoff_base_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.reconcile.backoff_base_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn owner_repo_splits() {
        let config = valid_config();
        assert_eq!(
            config.github.owner_repo().unwrap(),
            ("5dlabs".to_string(), "shop".to_string())
        );
    }
}
