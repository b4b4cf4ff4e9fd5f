//! Environment registry: the authoritative map from canary id to the
//! latest desired state (what the PR feed wants) and the latest applied
//! state (what the reconciler last materialized).
//!
//! Writes to a given id's entry are serialized by that id's reconcile
//! worker; cross-id reads take consistent point-in-time snapshots. The
//! applied record has exactly one writer: the reconcile worker.

use crate::reconcile::plan::ResourceObject;
use crate::routing::tag::CanaryId;
use crate::signal::{PrEvent, PrState};
use crate::types::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle intent for one environment, as last told by the signal source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredEnvironment {
    pub id: CanaryId,
    pub revision: String,
    pub state: PrState,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Reconciliation status of one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentStatus {
    /// Resources are being created or updated; not yet routable.
    Pending,
    /// Fully materialized at the applied revision; routable.
    Ready,
    /// Last reconcile attempt failed; retried with backoff.
    Degraded,
    /// Closed; resources are being removed.
    Pruning,
    /// All resources confirmed deleted.
    Absent,
}

/// What the reconciler last materialized for one environment. Written
/// exclusively by that id's reconcile worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedEnvironment {
    pub id: CanaryId,
    #[serde(rename = "lastAppliedRevision")]
    pub last_applied_revision: Option<String>,
    #[serde(rename = "resourceSet")]
    pub resource_set: Vec<ResourceObject>,
    pub status: EnvironmentStatus,
}

impl AppliedEnvironment {
    #[must_use]
    pub fn pending(id: CanaryId) -> Self {
        Self {
            id,
            last_applied_revision: None,
            resource_set: Vec::new(),
            status: EnvironmentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvEntry {
    pub desired: DesiredEnvironment,
    pub applied: AppliedEnvironment,
    /// Lifecycle intent that arrived while `desired` was a terminal Closed
    /// still being pruned; promoted by `begin_reopen` once pruning
    /// confirms Absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reopen: Option<DesiredEnvironment>,
}

/// Authoritative registry. One entry per canary id that has a live (or
/// not-yet-fully-pruned) environment.
#[derive(Default)]
pub struct EnvironmentRegistry {
    entries: DashMap<CanaryId, EnvEntry>,
}

impl EnvironmentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a lifecycle event to the desired state.
    ///
    /// Ordering rule: an event must not be older (by `updated_at`) than
    /// the stored desired state, and a duplicate (id, revision) pair is
    /// always stale. Timestamps have second resolution upstream, so an
    /// equal timestamp with a new revision still advances. Closed is
    /// accepted regardless of timestamp and is never overwritten in
    /// place; an Open arriving while the closed environment still prunes
    /// is held aside for `begin_reopen` rather than dropped, and a stale
    /// pre-close Updated delivered late is rejected.
    pub fn upsert_desired(&self, event: &PrEvent) -> Result<DesiredEnvironment> {
        let desired = DesiredEnvironment {
            id: event.id,
            revision: event.revision.clone(),
            state: event.state,
            updated_at: event.updated_at,
        };

        let stale = || Error::StaleEvent {
            id: event.id.as_u64(),
            revision: event.revision.clone(),
        };

        match self.entries.entry(event.id) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(EnvEntry {
                    desired: desired.clone(),
                    applied: AppliedEnvironment::pending(event.id),
                    reopen: None,
                });
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get().desired.clone();
                if current.state == PrState::Closed {
                    if event.state == PrState::Closed {
                        return Err(stale());
                    }
                    match &occupied.get().reopen {
                        // only a genuine reopen may follow a close; an
                        // out-of-order Updated from before the close is
                        // stale
                        None if event.state != PrState::Open
                            || event.updated_at < current.updated_at =>
                        {
                            return Err(stale());
                        }
                        // later events supersede an already-held reopen
                        // under the normal ordering rule
                        Some(held)
                            if event.revision == held.revision
                                || event.updated_at < held.updated_at =>
                        {
                            return Err(stale());
                        }
                        _ => {}
                    }
                    occupied.get_mut().reopen = Some(desired.clone());
                    debug!(id = %event.id, revision = %event.revision, "Reopen held until pruning completes");
                    return Ok(desired);
                }
                if event.state != PrState::Closed
                    && (event.revision == current.revision
                        || event.updated_at < current.updated_at)
                {
                    return Err(stale());
                }
                occupied.get_mut().desired = desired.clone();
            }
        }

        debug!(id = %event.id, revision = %event.revision, state = ?event.state, "Desired state recorded");
        Ok(desired)
    }

    #[must_use]
    pub fn get_desired(&self, id: CanaryId) -> Option<DesiredEnvironment> {
        self.entries.get(&id).map(|entry| entry.desired.clone())
    }

    #[must_use]
    pub fn get_applied(&self, id: CanaryId) -> Option<AppliedEnvironment> {
        self.entries.get(&id).map(|entry| entry.applied.clone())
    }

    /// Records what the reconcile worker materialized.
    pub fn record_applied(&self, id: CanaryId, applied: AppliedEnvironment) {
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.applied = applied;
        }
    }

    /// Ids with desired state that has not been fully pruned yet.
    #[must_use]
    pub fn list_active_ids(&self) -> Vec<CanaryId> {
        let mut ids: Vec<CanaryId> = self
            .entries
            .iter()
            .filter(|entry| entry.applied.status != EnvironmentStatus::Absent)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// Ids safe to surface to the routing layer. A canary rule is never
    /// published unless its environment is Ready.
    #[must_use]
    pub fn ready_ids(&self) -> Vec<CanaryId> {
        let mut ids: Vec<CanaryId> = self
            .entries
            .iter()
            .filter(|entry| entry.applied.status == EnvironmentStatus::Ready)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// Promotes a held reopen after pruning confirmed Absent: the entry
    /// restarts its lifecycle at the held revision with fresh applied
    /// state. `None` means nothing was held and the entry can be
    /// forgotten.
    pub fn begin_reopen(&self, id: CanaryId) -> Option<DesiredEnvironment> {
        let mut entry = self.entries.get_mut(&id)?;
        let next = entry.reopen.take()?;
        entry.desired = next.clone();
        entry.applied = AppliedEnvironment::pending(id);
        Some(next)
    }

    /// Drops the entry once pruning has confirmed Absent.
    pub fn forget(&self, id: CanaryId) {
        self.entries.remove(&id);
    }

    /// Consistent snapshot of every entry, for checkpointing.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EnvEntry> {
        let mut entries: Vec<EnvEntry> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|entry| entry.desired.id);
        entries
    }

    /// Restores entries from a checkpoint, skipping ids that already have
    /// fresher state (restore runs before signal sources start, so in
    /// practice the registry is empty).
    pub fn restore(&self, entries: Vec<EnvEntry>) {
        for entry in entries {
            self.entries.entry(entry.desired.id).or_insert(entry);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(id: u64, revision: &str, state: PrState, minute: u32) -> PrEvent {
        PrEvent {
            id: CanaryId(id),
            revision: revision.to_string(),
            state,
            updated_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap(),
        }
    }

    #[test]
    fn open_then_updated_advances_revision() {
        let registry = EnvironmentRegistry::new();
        registry
            .upsert_desired(&event(42, "a1", PrState::Open, 0))
            .unwrap();
        registry
            .upsert_desired(&event(42, "b2", PrState::Updated, 1))
            .unwrap();

        let desired = registry.get_desired(CanaryId(42)).unwrap();
        assert_eq!(desired.revision, "b2");
        assert_eq!(desired.state, PrState::Updated);
    }

    #[test]
    fn older_revision_after_newer_is_stale() {
        let registry = EnvironmentRegistry::new();
        registry
            .upsert_desired(&event(42, "b2", PrState::Updated, 5))
            .unwrap();

        let result = registry.upsert_desired(&event(42, "a1", PrState::Updated, 2));
        assert!(matches!(result, Err(Error::StaleEvent { id: 42, .. })));
        assert_eq!(registry.get_desired(CanaryId(42)).unwrap().revision, "b2");
    }

    #[test]
    fn equal_timestamp_with_new_revision_advances() {
        let registry = EnvironmentRegistry::new();
        registry
            .upsert_desired(&event(42, "a1", PrState::Open, 3))
            .unwrap();

        // opened and synchronized within the same second
        registry
            .upsert_desired(&event(42, "b2", PrState::Updated, 3))
            .unwrap();
        assert_eq!(registry.get_desired(CanaryId(42)).unwrap().revision, "b2");
    }

    #[test]
    fn duplicate_revision_is_stale() {
        let registry = EnvironmentRegistry::new();
        registry
            .upsert_desired(&event(42, "a1", PrState::Open, 0))
            .unwrap();

        let result = registry.upsert_desired(&event(42, "a1", PrState::Updated, 9));
        assert!(matches!(result, Err(Error::StaleEvent { .. })));
    }

    #[test]
    fn closed_is_forced_and_terminal() {
        let registry = EnvironmentRegistry::new();
        registry
            .upsert_desired(&event(42, "b2", PrState::Updated, 5))
            .unwrap();

        // Closed with an older timestamp still wins
        registry
            .upsert_desired(&event(42, "b2", PrState::Closed, 1))
            .unwrap();
        assert_eq!(registry.get_desired(CanaryId(42)).unwrap().state, PrState::Closed);

        // a duplicate close and a late pre-close Updated are both stale
        let result = registry.upsert_desired(&event(42, "b2", PrState::Closed, 2));
        assert!(matches!(result, Err(Error::StaleEvent { .. })));
        let result = registry.upsert_desired(&event(42, "c3", PrState::Updated, 9));
        assert!(matches!(result, Err(Error::StaleEvent { .. })));
        assert_eq!(registry.get_desired(CanaryId(42)).unwrap().state, PrState::Closed);
    }

    #[test]
    fn reopen_while_pruning_is_held_then_promoted() {
        let registry = EnvironmentRegistry::new();
        registry
            .upsert_desired(&event(42, "a1", PrState::Open, 0))
            .unwrap();
        registry
            .upsert_desired(&event(42, "a1", PrState::Closed, 1))
            .unwrap();

        // the PR reopens while the old environment still prunes: the
        // close stays in place, the intent is not lost
        registry
            .upsert_desired(&event(42, "b2", PrState::Open, 2))
            .unwrap();
        assert_eq!(registry.get_desired(CanaryId(42)).unwrap().state, PrState::Closed);

        // a push onto the reopened PR supersedes the held revision
        registry
            .upsert_desired(&event(42, "c3", PrState::Updated, 3))
            .unwrap();

        let next = registry.begin_reopen(CanaryId(42)).unwrap();
        assert_eq!(next.revision, "c3");
        let desired = registry.get_desired(CanaryId(42)).unwrap();
        assert_eq!(desired.state, PrState::Updated);
        assert_eq!(desired.revision, "c3");
        assert_eq!(
            registry.get_applied(CanaryId(42)).unwrap().status,
            EnvironmentStatus::Pending
        );
        assert!(registry.begin_reopen(CanaryId(42)).is_none());
    }

    #[test]
    fn ready_ids_only_includes_ready_environments() {
        let registry = EnvironmentRegistry::new();
        registry
            .upsert_desired(&event(1, "a", PrState::Open, 0))
            .unwrap();
        registry
            .upsert_desired(&event(2, "b", PrState::Open, 0))
            .unwrap();

        let mut ready = AppliedEnvironment::pending(CanaryId(1));
        ready.status = EnvironmentStatus::Ready;
        registry.record_applied(CanaryId(1), ready);

        assert_eq!(registry.ready_ids(), vec![CanaryId(1)]);
        assert_eq!(registry.list_active_ids(), vec![CanaryId(1), CanaryId(2)]);
    }

    #[test]
    fn forget_removes_the_entry() {
        let registry = EnvironmentRegistry::new();
        registry
            .upsert_desired(&event(42, "a1", PrState::Open, 0))
            .unwrap();
        registry.forget(CanaryId(42));
        assert!(registry.is_empty());
    }
}
