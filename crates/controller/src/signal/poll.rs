//! Poll-mode signal source.
//!
//! Periodically lists the open pull requests for the configured repository
//! and diffs the listing against the previous one: a new id synthesizes
//! Open, a changed head SHA synthesizes Updated, and an id that vanished
//! from the listing synthesizes Closed. An unchanged (id, revision) pair
//! produces no event at all, which is the poller's deduplication.

use crate::routing::tag::CanaryId;
use crate::signal::{EventSender, PrEvent, PrState};
use crate::types::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One open PR as seen in a poll snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPullRequest {
    pub id: CanaryId,
    pub head_sha: String,
    pub updated_at: DateTime<Utc>,
}

/// Abstraction over the listing endpoint so the diffing logic is testable
/// without GitHub.
#[async_trait]
pub trait PullRequestFeed: Send + Sync {
    async fn list_open(&self) -> Result<Vec<OpenPullRequest>>;
}

/// Production feed backed by the GitHub API.
pub struct GitHubFeed {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl GitHubFeed {
    pub fn new(owner: String, repo: String, token: Option<String>) -> Result<Self> {
        let octocrab = if let Some(token) = token {
            Octocrab::builder().personal_token(token).build()?
        } else {
            warn!("No GitHub token provided, using unauthenticated requests");
            Octocrab::builder().build()?
        };

        Ok(Self {
            octocrab,
            owner,
            repo,
        })
    }
}

#[async_trait]
impl PullRequestFeed for GitHubFeed {
    async fn list_open(&self) -> Result<Vec<OpenPullRequest>> {
        // 100 is the API maximum; a repository with more than 100 open
        // canary-labeled PRs is an operational problem before it is a
        // paging problem.
        let page = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::Open)
            .per_page(100)
            .send()
            .await?;

        let snapshot = page
            .items
            .into_iter()
            .map(|pr| OpenPullRequest {
                id: CanaryId(pr.number),
                head_sha: pr.head.sha.clone(),
                updated_at: pr.updated_at.unwrap_or_else(Utc::now),
            })
            .collect();

        Ok(snapshot)
    }
}

/// Diffs successive poll snapshots into lifecycle events.
pub struct PollWatcher {
    feed: Box<dyn PullRequestFeed>,
    known: HashMap<CanaryId, OpenPullRequest>,
}

impl PollWatcher {
    #[must_use]
    pub fn new(feed: Box<dyn PullRequestFeed>) -> Self {
        Self {
            feed,
            known: HashMap::new(),
        }
    }

    /// Fetches one snapshot and returns the synthesized events. The
    /// internal state only advances on a successful fetch, so a failed
    /// poll never produces spurious Closed events.
    pub async fn poll_once(&mut self) -> Result<Vec<PrEvent>> {
        let snapshot = self.feed.list_open().await?;
        let mut events = Vec::new();

        let mut next: HashMap<CanaryId, OpenPullRequest> = HashMap::with_capacity(snapshot.len());
        for pr in snapshot {
            match self.known.get(&pr.id) {
                None => {
                    events.push(PrEvent {
                        id: pr.id,
                        revision: pr.head_sha.clone(),
                        state: PrState::Open,
                        updated_at: pr.updated_at,
                    });
                }
                Some(previous) if previous.head_sha != pr.head_sha => {
                    events.push(PrEvent {
                        id: pr.id,
                        revision: pr.head_sha.clone(),
                        state: PrState::Updated,
                        updated_at: pr.updated_at,
                    });
                }
                Some(_) => {
                    // Same (id, revision) as last time: deduplicated.
                }
            }
            next.insert(pr.id, pr);
        }

        // An id we knew about that is missing from the listing has been
        // closed or merged; the feed has no delete notification, so the
        // absence itself is the signal.
        for (id, previous) in &self.known {
            if !next.contains_key(id) {
                events.push(PrEvent {
                    id: *id,
                    revision: previous.head_sha.clone(),
                    state: PrState::Closed,
                    updated_at: Utc::now(),
                });
            }
        }

        self.known = next;
        Ok(events)
    }

    /// Runs the poll loop forever, forwarding events to the reconcile
    /// manager. Fetch failures are logged and retried on the next tick.
    pub async fn run(mut self, interval: Duration, events: EventSender) {
        info!(interval_secs = interval.as_secs(), "Starting PR poll watcher");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(batch) => {
                    debug!(events = batch.len(), "Poll cycle complete");
                    for event in batch {
                        if events.send(event).is_err() {
                            info!("Event channel closed, stopping poll watcher");
                            return;
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "PR poll failed, will retry on next interval");
                }
            }
        }
    }
}
