//! Routing decision engine.
//!
//! The rule table is an immutable snapshot: one writer (the reconcile
//! manager) rebuilds it whenever an environment becomes Ready or stops
//! being Ready and publishes the new table atomically over a watch
//! channel. Readers resolve against whatever snapshot they last observed,
//! so a request can never see a partially updated rule set.

use crate::config::RoutingConfig;
use crate::routing::tag::{CanaryId, Tag};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub mod bridge;
pub mod tag;

/// Transport a request arrived on. Tagged routing must resolve to the same
/// logical environment on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
}

/// Concrete destination for a (protocol, logical target) pair, e.g.
/// `backend.pr-42.svc.cluster.local`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(pub String);

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One routing rule. `match_tag == None` is the fallback for its
/// (protocol, target) pair; it always exists and carries the lowest
/// priority so it is only selected when no tagged rule matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "matchTag")]
    pub match_tag: Option<CanaryId>,
    pub protocol: Protocol,
    #[serde(rename = "logicalTarget")]
    pub logical_target: String,
    pub destination: Destination,
    pub priority: i32,
}

const FALLBACK_PRIORITY: i32 = 0;
const CANARY_PRIORITY: i32 = 100;

/// Immutable snapshot of the full rule set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleTable {
    pub rules: Vec<RoutingRule>,
    /// Monotonic generation, bumped on every publish. Lets the poll
    /// fallback in the routing layer detect missed notifications.
    pub generation: u64,
}

impl RuleTable {
    /// Builds the table for the given set of Ready canary ids. A rule pair
    /// (HTTP + gRPC) is emitted per logical service for every Ready id,
    /// plus the mandatory fallback pair pointing at the stable namespace.
    /// Environments that are Pending, Degraded, or Pruning never appear:
    /// traffic must not be routed into a namespace that is still being
    /// created or torn down.
    #[must_use]
    pub fn build(config: &RoutingConfig, ready: &[CanaryId], generation: u64) -> Self {
        let mut rules = Vec::with_capacity((ready.len() + 1) * config.services.len() * 2);

        for service in &config.services {
            for protocol in [Protocol::Http, Protocol::Grpc] {
                rules.push(RoutingRule {
                    match_tag: None,
                    protocol,
                    logical_target: service.clone(),
                    destination: Destination(format!(
                        "{service}.{}.svc.cluster.local",
                        config.stable_namespace
                    )),
                    priority: FALLBACK_PRIORITY,
                });

                for &id in ready {
                    rules.push(RoutingRule {
                        match_tag: Some(id),
                        protocol,
                        logical_target: service.clone(),
                        destination: Destination(format!(
                            "{service}.{}{id}.svc.cluster.local",
                            config.namespace_prefix
                        )),
                        priority: CANARY_PRIORITY,
                    });
                }
            }
        }

        Self { rules, generation }
    }

    /// Resolves a request to its concrete destination. Pure lookup, no
    /// side effects: the highest-priority rule whose tag matches exactly
    /// wins, otherwise the fallback for the (protocol, target) pair. An
    /// absent, invalid, or unknown tag therefore silently lands on stable.
    /// Returns `None` only for a logical target the table does not front.
    #[must_use]
    pub fn resolve(&self, tag: Tag, protocol: Protocol, target: &str) -> Option<&Destination> {
        self.rules
            .iter()
            .filter(|rule| rule.protocol == protocol && rule.logical_target == target)
            .filter(|rule| match rule.match_tag {
                Some(rule_tag) => tag.id() == Some(rule_tag),
                None => true,
            })
            .max_by_key(|rule| rule.priority)
            .map(|rule| &rule.destination)
    }
}

/// Single-writer handle used by the reconcile manager to publish new
/// snapshots. Publishing is a best-effort notify; readers that miss it can
/// poll `GET /routes` instead.
pub struct RuleTablePublisher {
    config: RoutingConfig,
    tx: watch::Sender<Arc<RuleTable>>,
    generation: u64,
}

impl RuleTablePublisher {
    #[must_use]
    pub fn new(config: RoutingConfig) -> (Self, watch::Receiver<Arc<RuleTable>>) {
        let initial = Arc::new(RuleTable::build(&config, &[], 0));
        let (tx, rx) = watch::channel(initial);
        (
            Self {
                config,
                tx,
                generation: 0,
            },
            rx,
        )
    }

    /// Rebuilds and publishes the table for the current Ready set.
    pub fn publish(&mut self, ready: &[CanaryId]) {
        self.generation += 1;
        let table = Arc::new(RuleTable::build(&self.config, ready, self.generation));
        debug!(
            generation = self.generation,
            ready = ready.len(),
            rules = table.rules.len(),
            "Publishing routing rule table"
        );
        // send_replace never fails; a table with no readers is still the
        // authoritative snapshot for the /routes poll fallback.
        self.tx.send_replace(table);
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<RuleTable>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RoutingConfig {
        RoutingConfig {
            services: vec!["backend".to_string(), "gateway".to_string()],
            stable_namespace: "prod".to_string(),
            namespace_prefix: "pr-".to_string(),
        }
    }

    #[test]
    fn untagged_requests_resolve_to_stable() {
        let table = RuleTable::build(&test_config(), &[CanaryId(42)], 1);

        for protocol in [Protocol::Http, Protocol::Grpc] {
            let dest = table.resolve(Tag::NONE, protocol, "backend").unwrap();
            assert_eq!(dest.0, "backend.prod.svc.cluster.local");
        }
    }

    #[test]
    fn unknown_tags_resolve_to_stable() {
        let table = RuleTable::build(&test_config(), &[CanaryId(42)], 1);

        let dest = table
            .resolve(Tag::from(CanaryId(7)), Protocol::Http, "backend")
            .unwrap();
        assert_eq!(dest.0, "backend.prod.svc.cluster.local");
    }

    #[test]
    fn ready_canary_resolves_identically_on_both_protocols() {
        let table = RuleTable::build(&test_config(), &[CanaryId(42)], 1);

        let http = table
            .resolve(Tag::from(CanaryId(42)), Protocol::Http, "backend")
            .unwrap();
        let grpc = table
            .resolve(Tag::from(CanaryId(42)), Protocol::Grpc, "backend")
            .unwrap();
        assert_eq!(http.0, "backend.pr-42.svc.cluster.local");
        assert_eq!(http, grpc);
    }

    #[test]
    fn fallback_exists_for_every_pair_even_with_no_canaries() {
        let config = test_config();
        let table = RuleTable::build(&config, &[], 1);

        for service in &config.services {
            for protocol in [Protocol::Http, Protocol::Grpc] {
                assert!(
                    table.resolve(Tag::NONE, protocol, service).is_some(),
                    "missing fallback for {service}"
                );
            }
        }
    }

    #[test]
    fn unknown_target_resolves_to_none() {
        let table = RuleTable::build(&test_config(), &[], 1);
        assert!(table.resolve(Tag::NONE, Protocol::Http, "nope").is_none());
    }

    #[test]
    fn publisher_swaps_whole_snapshots() {
        let (mut publisher, rx) = RuleTablePublisher::new(test_config());
        assert_eq!(rx.borrow().generation, 0);

        publisher.publish(&[CanaryId(42)]);
        let table = rx.borrow().clone();
        assert_eq!(table.generation, 1);
        assert!(table
            .resolve(Tag::from(CanaryId(42)), Protocol::Http, "backend")
            .unwrap()
            .0
            .contains("pr-42"));

        publisher.publish(&[]);
        let table = rx.borrow().clone();
        assert_eq!(table.generation, 2);
        assert_eq!(
            table
                .resolve(Tag::from(CanaryId(42)), Protocol::Http, "backend")
                .unwrap()
                .0,
            "backend.prod.svc.cluster.local"
        );
    }
}
