//! Reconciliation planning: content-addressed resource objects and the
//! diff that turns desired vs applied state into an ordered operation list.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;

/// Content-addressed description of one cluster object the controller
/// manages. Equal `spec_hash` means applying the object again is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// `None` for cluster-scoped kinds (Namespace).
    pub namespace: Option<String>,
    #[serde(rename = "specHash")]
    pub spec_hash: String,
    /// Minimal spec payload. Full manifest rendering is an external
    /// concern; this is just enough for the applier to materialize.
    pub manifest: Value,
}

impl ResourceObject {
    #[must_use]
    pub fn new(
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
        manifest: Value,
    ) -> Self {
        let spec_hash = spec_hash_of(&manifest);
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            spec_hash,
            manifest,
        }
    }

    /// Identity of the object irrespective of its content.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Apply/delete ordering rank. Scoping resources come first so that
    /// nothing is created into a namespace that does not exist yet, and
    /// routing objects come last so they never reference a workload that
    /// is not there. Deletes run in the reverse order.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self.kind.as_str() {
            "Namespace" => 0,
            "HTTPRoute" | "GRPCRoute" => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ResourceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}", ns, self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// Hex SHA-1 of the serialized manifest. serde_json serializes maps in
/// insertion order and the manifests are constructed deterministically,
/// so the hash is stable for identical content.
#[must_use]
pub fn spec_hash_of(manifest: &Value) -> String {
    let mut hasher = Sha1::new();
    hasher.update(manifest.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create(ResourceObject),
    Update(ResourceObject),
    Delete(ResourceObject),
}

impl Op {
    #[must_use]
    pub fn resource(&self) -> &ResourceObject {
        match self {
            Op::Create(r) | Op::Update(r) | Op::Delete(r) => r,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create(r) => write!(f, "create {r}"),
            Op::Update(r) => write!(f, "update {r}"),
            Op::Delete(r) => write!(f, "delete {r}"),
        }
    }
}

/// Ordered operations that move applied state toward desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub ops: Vec<Op>,
}

impl ReconciliationPlan {
    /// Diffs the desired resource set against what was last applied:
    /// Create for desired-but-absent, Update for present-with-different
    /// hash, Delete for applied-but-no-longer-desired. Creates and updates
    /// run scoping-first; deletes run routing-first (reverse rank) so
    /// nothing dangles mid-plan.
    #[must_use]
    pub fn diff(desired: &[ResourceObject], applied: &[ResourceObject]) -> Self {
        let applied_by_key: HashMap<ResourceKey, &ResourceObject> =
            applied.iter().map(|r| (r.key(), r)).collect();

        let mut upserts: Vec<Op> = Vec::new();
        for resource in desired {
            match applied_by_key.get(&resource.key()) {
                None => upserts.push(Op::Create(resource.clone())),
                Some(existing) if existing.spec_hash != resource.spec_hash => {
                    upserts.push(Op::Update(resource.clone()));
                }
                Some(_) => {} // unchanged, no-op
            }
        }
        upserts.sort_by(|a, b| {
            (a.resource().rank(), &a.resource().name)
                .cmp(&(b.resource().rank(), &b.resource().name))
        });

        let desired_keys: HashMap<ResourceKey, ()> =
            desired.iter().map(|r| (r.key(), ())).collect();
        let mut deletes: Vec<Op> = applied
            .iter()
            .filter(|r| !desired_keys.contains_key(&r.key()))
            .map(|r| Op::Delete(r.clone()))
            .collect();
        deletes.sort_by(|a, b| {
            (b.resource().rank(), &a.resource().name)
                .cmp(&(a.resource().rank(), &b.resource().name))
        });

        let mut ops = upserts;
        ops.extend(deletes);
        Self { ops }
    }

    /// Plan that removes every applied resource (desired state Closed).
    #[must_use]
    pub fn prune(applied: &[ResourceObject]) -> Self {
        Self::diff(&[], applied)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(name: &str) -> ResourceObject {
        ResourceObject::new("v1", "Namespace", name, None, json!({ "name": name }))
    }

    fn deploy(name: &str, namespace: &str, image: &str) -> ResourceObject {
        ResourceObject::new(
            "apps/v1",
            "Deployment",
            name,
            Some(namespace),
            json!({ "image": image }),
        )
    }

    fn route(name: &str, namespace: &str, backend: &str) -> ResourceObject {
        ResourceObject::new(
            "gateway.networking.k8s.io/v1",
            "HTTPRoute",
            name,
            Some(namespace),
            json!({ "backend": backend }),
        )
    }

    #[test]
    fn creates_run_in_dependency_order() {
        let desired = vec![
            route("backend", "pr-42", "backend"),
            deploy("backend", "pr-42", "backend:a1"),
            ns("pr-42"),
        ];
        let plan = ReconciliationPlan::diff(&desired, &[]);

        let kinds: Vec<&str> = plan.ops.iter().map(|op| op.resource().kind.as_str()).collect();
        assert_eq!(kinds, ["Namespace", "Deployment", "HTTPRoute"]);
        assert!(plan.ops.iter().all(|op| matches!(op, Op::Create(_))));
    }

    #[test]
    fn deletes_run_in_reverse_dependency_order() {
        let applied = vec![
            ns("pr-42"),
            deploy("backend", "pr-42", "backend:a1"),
            route("backend", "pr-42", "backend"),
        ];
        let plan = ReconciliationPlan::prune(&applied);

        let kinds: Vec<&str> = plan.ops.iter().map(|op| op.resource().kind.as_str()).collect();
        assert_eq!(kinds, ["HTTPRoute", "Deployment", "Namespace"]);
        assert!(plan.ops.iter().all(|op| matches!(op, Op::Delete(_))));
    }

    #[test]
    fn unchanged_spec_hash_is_a_no_op() {
        let desired = vec![ns("pr-42"), deploy("backend", "pr-42", "backend:a1")];
        let applied = desired.clone();

        assert!(ReconciliationPlan::diff(&desired, &applied).is_empty());
    }

    #[test]
    fn changed_content_becomes_an_update() {
        let applied = vec![deploy("backend", "pr-42", "backend:a1")];
        let desired = vec![deploy("backend", "pr-42", "backend:b2")];

        let plan = ReconciliationPlan::diff(&desired, &applied);
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan.ops[0], Op::Update(r) if r.name == "backend"));
    }

    #[test]
    fn mixed_plan_upserts_before_deletes() {
        let applied = vec![deploy("old", "pr-42", "old:a1")];
        let desired = vec![ns("pr-42"), deploy("new", "pr-42", "new:a1")];

        let plan = ReconciliationPlan::diff(&desired, &applied);
        assert_eq!(plan.len(), 3);
        assert!(matches!(&plan.ops[0], Op::Create(r) if r.kind == "Namespace"));
        assert!(matches!(&plan.ops[1], Op::Create(r) if r.name == "new"));
        assert!(matches!(&plan.ops[2], Op::Delete(r) if r.name == "old"));
    }

    #[test]
    fn spec_hash_tracks_content() {
        let a = deploy("backend", "pr-42", "backend:a1");
        let b = deploy("backend", "pr-42", "backend:a1");
        let c = deploy("backend", "pr-42", "backend:b2");
        assert_eq!(a.spec_hash, b.spec_hash);
        assert_ne!(a.spec_hash, c.spec_hash);
    }
}
