//! Desired resource set for one canary environment.
//!
//! Rendering full production manifests is an external concern; this module
//! derives the minimal, deterministic resource objects the controller owns:
//! the environment namespace, one workload per fronted service pinned to
//! the PR's head revision, and the routing object that exposes it.

use crate::config::{EnvironmentConfig, RoutingConfig};
use crate::reconcile::plan::ResourceObject;
use crate::routing::tag::CanaryId;
use serde_json::json;

/// Label carrying the owning canary id on every managed object.
pub const LABEL_CANARY_ID: &str = "canary.cto.dev/id";
/// Label carrying the applied revision on every managed object.
pub const LABEL_REVISION: &str = "canary.cto.dev/revision";

/// Namespace name for a canary environment, e.g. `pr-42`.
#[must_use]
pub fn environment_namespace(routing: &RoutingConfig, id: CanaryId) -> String {
    format!("{}{id}", routing.namespace_prefix)
}

/// Builds the full desired resource set for (id, revision).
#[must_use]
pub fn desired_resources(
    routing: &RoutingConfig,
    environment: &EnvironmentConfig,
    id: CanaryId,
    revision: &str,
) -> Vec<ResourceObject> {
    let namespace = environment_namespace(routing, id);
    // Only the workload carries the revision label: namespace and route are
    // revision-independent, so a new push updates the Deployment alone.
    let owner_labels = json!({ LABEL_CANARY_ID: id.to_string() });
    let workload_labels = json!({
        LABEL_CANARY_ID: id.to_string(),
        LABEL_REVISION: revision,
    });

    let mut resources = vec![ResourceObject::new(
        "v1",
        "Namespace",
        &namespace,
        None,
        json!({ "metadata": { "labels": owner_labels.clone() } }),
    )];

    for service in &routing.services {
        resources.push(ResourceObject::new(
            "apps/v1",
            "Deployment",
            service,
            Some(&namespace),
            json!({
                "metadata": { "labels": workload_labels.clone() },
                "spec": {
                    "replicas": environment.replicas,
                    "selector": { "matchLabels": { "app": service } },
                    "template": {
                        "metadata": { "labels": { "app": service } },
                        "spec": {
                            "containers": [{
                                "name": service,
                                "image": format!("{}/{service}:{revision}", environment.registry),
                            }]
                        }
                    }
                }
            }),
        ));

        resources.push(ResourceObject::new(
            "gateway.networking.k8s.io/v1",
            "HTTPRoute",
            service,
            Some(&namespace),
            json!({
                "metadata": { "labels": owner_labels.clone() },
                "spec": {
                    "rules": [{
                        "backendRefs": [{ "name": service, "port": 80 }]
                    }]
                }
            }),
        ));
    }

    resources
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> (RoutingConfig, EnvironmentConfig) {
        (
            RoutingConfig {
                services: vec!["backend".to_string()],
                stable_namespace: "prod".to_string(),
                namespace_prefix: "pr-".to_string(),
            },
            EnvironmentConfig::default(),
        )
    }

    #[test]
    fn resource_set_scopes_everything_to_the_environment_namespace() {
        let (routing, environment) = configs();
        let resources = desired_resources(&routing, &environment, CanaryId(42), "a1");

        assert_eq!(resources.len(), 3);
        assert_eq!(resources[0].kind, "Namespace");
        assert_eq!(resources[0].name, "pr-42");
        assert!(resources[1..]
            .iter()
            .all(|r| r.namespace.as_deref() == Some("pr-42")));
    }

    #[test]
    fn revision_change_changes_workload_hash_only_where_it_matters() {
        let (routing, environment) = configs();
        let at_a1 = desired_resources(&routing, &environment, CanaryId(42), "a1");
        let at_b2 = desired_resources(&routing, &environment, CanaryId(42), "b2");

        let deploy_a1 = at_a1.iter().find(|r| r.kind == "Deployment").unwrap();
        let deploy_b2 = at_b2.iter().find(|r| r.kind == "Deployment").unwrap();
        assert_ne!(deploy_a1.spec_hash, deploy_b2.spec_hash);

        // namespace and route are revision-independent
        assert_eq!(at_a1[0].spec_hash, at_b2[0].spec_hash);
        let route_a1 = at_a1.iter().find(|r| r.kind == "HTTPRoute").unwrap();
        let route_b2 = at_b2.iter().find(|r| r.kind == "HTTPRoute").unwrap();
        assert_eq!(route_a1.spec_hash, route_b2.spec_hash);
    }

    #[test]
    fn same_inputs_hash_identically() {
        let (routing, environment) = configs();
        let first = desired_resources(&routing, &environment, CanaryId(42), "a1");
        let second = desired_resources(&routing, &environment, CanaryId(42), "a1");
        assert_eq!(first, second);
    }
}
