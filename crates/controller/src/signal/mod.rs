//! Signal source: turns the external pull-request lifecycle feed into
//! canonical (id, revision, state) events.
//!
//! Two delivery modes feed the same channel: a poller that diffs periodic
//! full listings of open PRs (GitHub has no native "deleted" notification
//! for a poll consumer, so Closed is synthesized from absence), and a
//! webhook receiver for push delivery. Push delivery is at-least-once and
//! may be duplicated or reordered; the environment registry's ordering
//! rule is what makes consumption safe.

use crate::routing::tag::CanaryId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod poll;
pub mod webhook;

/// Lifecycle intent carried by one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrState {
    Open,
    Updated,
    Closed,
}

/// Canonical lifecycle event for one canary environment. `revision` is the
/// head commit SHA of the PR at the time of the event; `updated_at` orders
/// events for the same id since SHAs themselves are opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrEvent {
    pub id: CanaryId,
    pub revision: String,
    pub state: PrState,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Channel half handed to signal sources.
pub type EventSender = mpsc::UnboundedSender<PrEvent>;
/// Channel half consumed by the reconcile manager.
pub type EventReceiver = mpsc::UnboundedReceiver<PrEvent>;

#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
