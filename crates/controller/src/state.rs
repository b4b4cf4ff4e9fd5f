//! ConfigMap-backed checkpoint of the environment registry.
//!
//! Reconciliation itself is driven from the in-memory registry; the
//! checkpoint exists so a restarted controller can see which environments
//! were mid-prune and resume deleting their resources instead of leaking
//! them. Saving is best-effort: a failed checkpoint is logged and the
//! next transition tries again.

use crate::registry::EnvEntry;
use crate::types::Result;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const DATA_KEY: &str = "environments";

pub struct StateStore {
    configmaps: Api<ConfigMap>,
    name: String,
}

impl StateStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            configmaps: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    fn render(&self, entries: &[EnvEntry]) -> Result<ConfigMap> {
        let serialized = serde_json::to_string(entries)?;
        let mut data = BTreeMap::new();
        data.insert(DATA_KEY.to_string(), serialized);

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        })
    }

    /// Persists a registry snapshot, creating the ConfigMap on first use.
    pub async fn save(&self, entries: &[EnvEntry]) -> Result<()> {
        let configmap = self.render(entries)?;

        match self
            .configmaps
            .create(&PostParams::default(), &configmap)
            .await
        {
            Ok(_) => {
                debug!(name = %self.name, entries = entries.len(), "Checkpoint created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                self.configmaps
                    .patch(
                        &self.name,
                        &PatchParams::default(),
                        &Patch::Merge(&configmap),
                    )
                    .await?;
                debug!(name = %self.name, entries = entries.len(), "Checkpoint updated");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Loads the last checkpoint. A missing ConfigMap or unreadable
    /// payload is an empty checkpoint, never a startup failure.
    pub async fn load(&self) -> Result<Vec<EnvEntry>> {
        let configmap = match self.configmaps.get(&self.name).await {
            Ok(cm) => cm,
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let Some(raw) = configmap.data.as_ref().and_then(|data| data.get(DATA_KEY)) else {
            return Ok(Vec::new());
        };

        match serde_json::from_str(raw) {
            Ok(entries) => Ok(entries),
            Err(error) => {
                warn!(%error, name = %self.name, "Discarding unreadable checkpoint");
                Ok(Vec::new())
            }
        }
    }
}
