//! Resource applier: the interface to the cluster layer that materializes
//! and removes managed objects, plus the production Kubernetes impl.
//!
//! Every call is idempotent and safe to retry; the error taxonomy tells
//! the reconciler which failures are worth retrying.

use crate::reconcile::plan::ResourceObject;
use async_trait::async_trait;
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure taxonomy surfaced by appliers.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    /// Concurrent modification; retry with refreshed state.
    #[error("conflict applying {0}")]
    Conflict(String),

    /// Object does not exist. Benign on delete.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Permanently rejected; do not retry until the desired state changes.
    #[error("invalid resource {0}: {1}")]
    Invalid(String, String),

    /// Transient outage or deadline expiry; retry with backoff.
    #[error("cluster unavailable applying {0}: {1}")]
    Unavailable(String, String),
}

impl ApplyError {
    /// Whether the reconciler should retry this failure with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyError::Conflict(_) | ApplyError::Unavailable(_, _))
    }
}

/// CRUD plus existence check over managed resource objects. Provided by
/// the surrounding cluster/GitOps layer; the reconciler only ever talks
/// through this trait.
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    async fn create(&self, resource: &ResourceObject) -> Result<(), ApplyError>;
    async fn update(&self, resource: &ResourceObject) -> Result<(), ApplyError>;
    async fn delete(&self, resource: &ResourceObject) -> Result<(), ApplyError>;
    async fn exists(&self, resource: &ResourceObject) -> Result<bool, ApplyError>;
}

/// Production applier over the Kubernetes dynamic API. Every call carries
/// a bounded deadline; exceeding it surfaces as `Unavailable`.
pub struct KubeApplier {
    client: Client,
    deadline: Duration,
}

impl KubeApplier {
    #[must_use]
    pub fn new(client: Client, deadline: Duration) -> Self {
        Self { client, deadline }
    }

    fn api_for(&self, resource: &ResourceObject) -> (Api<DynamicObject>, ApiResource) {
        let (group, version) = match resource.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", resource.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &resource.kind);
        let api_resource = ApiResource::from_gvk(&gvk);

        let api = match &resource.namespace {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, &api_resource)
            }
            None => Api::all_with(self.client.clone(), &api_resource),
        };
        (api, api_resource)
    }

    fn dynamic_object(resource: &ResourceObject, api_resource: &ApiResource) -> DynamicObject {
        let mut object = DynamicObject::new(&resource.name, api_resource)
            .data(resource.manifest.clone());
        if let Some(namespace) = &resource.namespace {
            object = object.within(namespace);
        }
        object.metadata.annotations = Some(
            [(
                "canary.cto.dev/spec-hash".to_string(),
                resource.spec_hash.clone(),
            )]
            .into(),
        );
        object
    }

    async fn with_deadline<T, F>(&self, resource: &ResourceObject, fut: F) -> Result<T, ApplyError>
    where
        F: Future<Output = Result<T, kube::Error>> + Send,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result.map_err(|error| map_kube_error(resource, &error)),
            Err(_elapsed) => Err(ApplyError::Unavailable(
                resource.to_string(),
                format!("deadline of {:?} exceeded", self.deadline),
            )),
        }
    }
}

fn map_kube_error(resource: &ResourceObject, error: &kube::Error) -> ApplyError {
    match error {
        kube::Error::Api(response) => match response.code {
            409 => ApplyError::Conflict(resource.to_string()),
            404 | 410 => ApplyError::NotFound(resource.to_string()),
            400 | 422 => ApplyError::Invalid(resource.to_string(), response.message.clone()),
            _ => ApplyError::Unavailable(resource.to_string(), response.message.clone()),
        },
        other => ApplyError::Unavailable(resource.to_string(), other.to_string()),
    }
}

#[async_trait]
impl ResourceApplier for KubeApplier {
    async fn create(&self, resource: &ResourceObject) -> Result<(), ApplyError> {
        let (api, api_resource) = self.api_for(resource);
        let object = Self::dynamic_object(resource, &api_resource);

        match self
            .with_deadline(resource, api.create(&PostParams::default(), &object))
            .await
        {
            Ok(_) => {
                debug!(resource = %resource, "Created");
                Ok(())
            }
            // Already exists, typically left over from a previous
            // controller incarnation. The leftover may carry different
            // content than this create, so patch it in place instead of
            // treating the name collision as convergence.
            Err(ApplyError::Conflict(_)) => {
                debug!(resource = %resource, "Already exists, patching in place");
                self.update(resource).await
            }
            Err(error) => Err(error),
        }
    }

    async fn update(&self, resource: &ResourceObject) -> Result<(), ApplyError> {
        let (api, api_resource) = self.api_for(resource);
        let object = Self::dynamic_object(resource, &api_resource);

        self.with_deadline(
            resource,
            api.patch(
                &resource.name,
                &PatchParams::default(),
                &Patch::Merge(&object),
            ),
        )
        .await?;
        debug!(resource = %resource, "Updated");
        Ok(())
    }

    async fn delete(&self, resource: &ResourceObject) -> Result<(), ApplyError> {
        let (api, _) = self.api_for(resource);

        match self
            .with_deadline(resource, async {
                api.delete(&resource.name, &DeleteParams::default())
                    .await
                    .map(|_| ())
            })
            .await
        {
            Ok(()) => {
                debug!(resource = %resource, "Delete requested");
                Ok(())
            }
            // Already gone is what delete wanted in the first place.
            Err(ApplyError::NotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn exists(&self, resource: &ResourceObject) -> Result<bool, ApplyError> {
        let (api, _) = self.api_for(resource);

        match self
            .with_deadline(resource, api.get(&resource.name))
            .await
        {
            Ok(_) => Ok(true),
            Err(ApplyError::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::client::Body;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    #[test]
    fn transient_classification_matches_the_taxonomy() {
        assert!(ApplyError::Conflict("x".into()).is_transient());
        assert!(ApplyError::Unavailable("x".into(), "down".into()).is_transient());
        assert!(!ApplyError::NotFound("x".into()).is_transient());
        assert!(!ApplyError::Invalid("x".into(), "bad".into()).is_transient());
    }

    /// Scripted apiserver: answers POST with 409 AlreadyExists and
    /// anything else with the object, recording every method.
    fn conflicting_client(calls: Arc<Mutex<Vec<String>>>) -> Client {
        let service = tower::service_fn(move |request: http::Request<Body>| {
            let calls = calls.clone();
            async move {
                let method = request.method().to_string();
                calls.lock().unwrap().push(method.clone());
                let response = if method == "POST" {
                    http::Response::builder()
                        .status(409)
                        .header("content-type", "application/json")
                        .body(Body::from(
                            json!({
                                "kind": "Status",
                                "apiVersion": "v1",
                                "status": "Failure",
                                "message": "deployments.apps \"backend\" already exists",
                                "reason": "AlreadyExists",
                                "code": 409
                            })
                            .to_string()
                            .into_bytes(),
                        ))
                        .unwrap()
                } else {
                    http::Response::builder()
                        .status(200)
                        .header("content-type", "application/json")
                        .body(Body::from(
                            json!({
                                "apiVersion": "apps/v1",
                                "kind": "Deployment",
                                "metadata": { "name": "backend", "namespace": "pr-42" }
                            })
                            .to_string()
                            .into_bytes(),
                        ))
                        .unwrap()
                };
                Ok::<_, Infallible>(response)
            }
        });
        Client::new(service, "pr-42")
    }

    #[tokio::test]
    async fn create_patches_in_place_when_object_already_exists() {
        let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let applier = KubeApplier::new(
            conflicting_client(calls.clone()),
            Duration::from_secs(5),
        );
        let resource = ResourceObject::new(
            "apps/v1",
            "Deployment",
            "backend",
            Some("pr-42"),
            json!({ "spec": { "replicas": 1 } }),
        );

        applier.create(&resource).await.unwrap();

        // the name collision did not end the create; the existing object
        // was patched to this content
        assert_eq!(calls.lock().unwrap().as_slice(), ["POST", "PATCH"]);
    }
}
