//! Reconciliation controller.
//!
//! Work is partitioned by canary id: each id gets its own worker task, so
//! environments reconcile independently and in parallel while operations
//! for the same id stay strictly serialized. A semaphore caps how many
//! workers may run a tick at once so a burst of PR activity cannot stampede
//! the cluster API.
//!
//! Status machine per id:
//! Absent -> Pending(create) -> Ready -> Pending(update) -> Ready -> Pruning -> Absent
//! with repeated transient failure reported as Degraded while retries
//! continue under capped, jittered exponential backoff. A Closed event
//! preempts an in-flight create/update plan: the worker abandons the rest
//! of the plan and switches to pruning. An Open arriving while the old
//! environment still prunes is held in the registry and the environment
//! is recreated once pruning confirms Absent.

use crate::applier::{ApplyError, ResourceApplier};
use crate::config::ControllerConfig;
use crate::registry::{
    AppliedEnvironment, DesiredEnvironment, EnvironmentRegistry, EnvironmentStatus,
};
use crate::routing::tag::CanaryId;
use crate::routing::RuleTablePublisher;
use crate::signal::{EventReceiver, PrState};
use crate::types::Error;
use dashmap::DashMap;
use self::plan::{Op, ReconciliationPlan, ResourceKey, ResourceObject};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info, instrument, warn};

pub mod plan;
pub mod resources;

/// Outcome of one reconcile step, carried on the observability hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// A plan with this many operations was computed and is being applied.
    Planned { operations: usize },
    /// All operations applied; environment converged at its revision.
    Converged { operations: usize },
    /// Desired state unchanged; the diff produced zero operations.
    NoOp,
    /// Transient failure; the worker retries with backoff.
    Retrying { error: String },
    /// Permanent failure; no retry until a new revision arrives.
    Failed { error: String },
    /// All resources confirmed deleted.
    Pruned,
}

/// Structured event emitted on every state transition and plan
/// application. The core does not format or ship logs; consumers
/// subscribe to the broadcast channel (and everything is mirrored as a
/// tracing event).
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub id: CanaryId,
    pub from: EnvironmentStatus,
    pub to: EnvironmentStatus,
    pub revision: String,
    pub outcome: Outcome,
}

enum TickResult {
    /// Converged; wait for the next event.
    Idle,
    /// Transient failure; retry with backoff.
    Retry,
    /// Permanent failure; wait for a new revision.
    Blocked,
    /// Preempted mid-plan; tick again immediately.
    Again,
    /// Environment fully pruned; the worker exits.
    Done,
}

pub struct ReconcileManager {
    registry: Arc<EnvironmentRegistry>,
    applier: Arc<dyn ResourceApplier>,
    config: Arc<ControllerConfig>,
    publisher: Mutex<RuleTablePublisher>,
    checkpoint: Option<crate::state::StateStore>,
    workers: DashMap<CanaryId, mpsc::UnboundedSender<()>>,
    limiter: Arc<Semaphore>,
    transitions: broadcast::Sender<TransitionEvent>,
}

impl ReconcileManager {
    #[must_use]
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        applier: Arc<dyn ResourceApplier>,
        publisher: RuleTablePublisher,
        checkpoint: Option<crate::state::StateStore>,
        config: Arc<ControllerConfig>,
    ) -> Arc<Self> {
        let limiter = Arc::new(Semaphore::new(config.reconcile.max_concurrent));
        let (transitions, _) = broadcast::channel(256);
        Arc::new(Self {
            registry,
            applier,
            config,
            publisher: Mutex::new(publisher),
            checkpoint,
            workers: DashMap::new(),
            limiter,
            transitions,
        })
    }

    /// Observability hook: every state transition and plan application.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<TransitionEvent> {
        self.transitions.subscribe()
    }

    /// Spawns workers for entries restored from a checkpoint, so pruning
    /// interrupted by a restart resumes instead of leaking resources.
    pub fn resume(self: &Arc<Self>) {
        for entry in self.registry.snapshot() {
            info!(id = %entry.desired.id, status = ?entry.applied.status, "Resuming environment from checkpoint");
            self.ensure_worker(entry.desired.id);
        }
        self.publish_routes();
    }

    /// Consumes lifecycle events until the channel closes. Stale events
    /// are logged and dropped here; everything else wakes the per-id
    /// worker.
    pub async fn run(self: Arc<Self>, mut events: EventReceiver) {
        info!("Reconcile manager started");
        while let Some(event) = events.recv().await {
            match self.registry.upsert_desired(&event) {
                Ok(_) => self.ensure_worker(event.id),
                Err(Error::StaleEvent { id, revision }) => {
                    info!(id, %revision, "Ignoring stale lifecycle event");
                }
                Err(error) => {
                    warn!(%error, id = %event.id, "Failed to record desired state");
                }
            }
        }
        info!("Event channel closed, reconcile manager stopping");
    }

    /// Wakes the worker for an id, spawning one if none is live. The
    /// entry guard makes the check-and-spawn atomic, so two racing calls
    /// can never leave two live workers for the same id.
    fn ensure_worker(self: &Arc<Self>, id: CanaryId) {
        loop {
            match self.workers.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => {
                    if occupied.get().send(()).is_ok() {
                        return;
                    }
                    // channel already closed by a worker mid-teardown
                    occupied.remove();
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    vacant.insert(tx.clone());
                    let manager = self.clone();
                    tokio::spawn(async move {
                        manager.worker_loop(id, tx, rx).await;
                    });
                    return;
                }
            }
        }
    }

    #[instrument(skip(self, handle, nudges), fields(canary_id = %id))]
    async fn worker_loop(
        self: Arc<Self>,
        id: CanaryId,
        handle: mpsc::UnboundedSender<()>,
        mut nudges: mpsc::UnboundedReceiver<()>,
    ) {
        debug!("Worker started");
        let mut attempt: u32 = 0;
        let mut immediate = true;

        loop {
            if !immediate {
                if attempt == 0 {
                    if nudges.recv().await.is_none() {
                        break;
                    }
                } else {
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, ?delay, "Backing off before retry");
                    tokio::select! {
                        nudge = nudges.recv() => {
                            if nudge.is_none() {
                                break;
                            }
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                // collapse queued nudges into the single tick that follows
                while nudges.try_recv().is_ok() {}
            }
            immediate = false;

            let Ok(permit) = self.limiter.clone().acquire_owned().await else {
                break;
            };
            let result = self.tick(id, attempt).await;
            drop(permit);

            match result {
                TickResult::Idle | TickResult::Blocked => attempt = 0,
                TickResult::Retry => attempt = attempt.saturating_add(1),
                TickResult::Again => {
                    attempt = 0;
                    immediate = true;
                }
                TickResult::Done => break,
            }
        }

        // Close the channel before leaving the map: an event racing this
        // teardown either fails its send (and replaces the worker) or has
        // already written desired state, which is handed back below.
        nudges.close();
        self.workers
            .remove_if(&id, |_, sender| sender.same_channel(&handle));
        if self.registry.get_desired(id).is_some() {
            self.ensure_worker(id);
        }
        debug!("Worker stopped");
    }

    async fn tick(&self, id: CanaryId, attempt: u32) -> TickResult {
        let Some(desired) = self.registry.get_desired(id) else {
            return TickResult::Done;
        };
        let applied = self
            .registry
            .get_applied(id)
            .unwrap_or_else(|| AppliedEnvironment::pending(id));

        match desired.state {
            PrState::Closed => self.prune(id, &desired, applied, attempt).await,
            PrState::Open | PrState::Updated => {
                self.converge(id, &desired, applied, attempt).await
            }
        }
    }

    /// Drives one create/update cycle toward the desired revision.
    async fn converge(
        &self,
        id: CanaryId,
        desired: &DesiredEnvironment,
        applied: AppliedEnvironment,
        attempt: u32,
    ) -> TickResult {
        let from = applied.status;

        if desired.revision.is_empty() {
            let error = Error::ValidationError {
                id: id.as_u64(),
                reason: "desired state carries no revision".to_string(),
            };
            let mut degraded = applied;
            degraded.status = EnvironmentStatus::Degraded;
            self.registry.record_applied(id, degraded);
            self.emit(
                id,
                from,
                EnvironmentStatus::Degraded,
                &desired.revision,
                Outcome::Failed {
                    error: error.to_string(),
                },
            );
            return TickResult::Blocked;
        }

        let desired_set = resources::desired_resources(
            &self.config.routing,
            &self.config.environment,
            id,
            &desired.revision,
        );
        let plan = ReconciliationPlan::diff(&desired_set, &applied.resource_set);

        if plan.is_empty() && from == EnvironmentStatus::Ready {
            self.emit(id, from, from, &desired.revision, Outcome::NoOp);
            return TickResult::Idle;
        }

        let mut current = applied;
        current.status = EnvironmentStatus::Pending;
        self.registry.record_applied(id, current.clone());
        if from == EnvironmentStatus::Ready {
            // leaving the Ready set: stop routing into the environment
            // while it is being mutated
            self.publish_routes();
        }
        self.emit(
            id,
            from,
            EnvironmentStatus::Pending,
            &desired.revision,
            Outcome::Planned {
                operations: plan.len(),
            },
        );

        let mut resource_set: HashMap<ResourceKey, ResourceObject> = current
            .resource_set
            .iter()
            .map(|r| (r.key(), r.clone()))
            .collect();
        let operations = plan.len();

        for op in &plan.ops {
            // A Closed event preempts the rest of this plan.
            match self.registry.get_desired(id) {
                Some(d) if d.state == PrState::Closed => {
                    self.record_set(id, &mut current, resource_set);
                    info!(id = %id, "Closed during apply, switching to prune");
                    return TickResult::Again;
                }
                Some(_) => {}
                None => return TickResult::Done,
            }

            match self.apply_op(op).await {
                Ok(()) => match op {
                    Op::Create(r) | Op::Update(r) => {
                        resource_set.insert(r.key(), r.clone());
                    }
                    Op::Delete(r) => {
                        resource_set.remove(&r.key());
                    }
                },
                Err(error) if error.is_transient() => {
                    let to = self.failure_status(attempt, EnvironmentStatus::Pending);
                    current.status = to;
                    self.record_set(id, &mut current, resource_set);
                    self.emit(
                        id,
                        EnvironmentStatus::Pending,
                        to,
                        &desired.revision,
                        Outcome::Retrying {
                            error: error.to_string(),
                        },
                    );
                    return TickResult::Retry;
                }
                Err(error) => {
                    current.status = EnvironmentStatus::Degraded;
                    self.record_set(id, &mut current, resource_set);
                    self.emit(
                        id,
                        EnvironmentStatus::Pending,
                        EnvironmentStatus::Degraded,
                        &desired.revision,
                        Outcome::Failed {
                            error: error.to_string(),
                        },
                    );
                    return TickResult::Blocked;
                }
            }
        }

        current.status = EnvironmentStatus::Ready;
        current.last_applied_revision = Some(desired.revision.clone());
        self.record_set(id, &mut current, resource_set);
        self.emit(
            id,
            EnvironmentStatus::Pending,
            EnvironmentStatus::Ready,
            &desired.revision,
            Outcome::Converged { operations },
        );
        self.publish_routes();
        self.write_checkpoint().await;
        TickResult::Idle
    }

    /// Removes every resource of a Closed environment. Completion requires
    /// confirmed absence, not merely a requested delete: a resource only
    /// leaves the applied set once `exists` says it is gone.
    async fn prune(
        &self,
        id: CanaryId,
        desired: &DesiredEnvironment,
        mut applied: AppliedEnvironment,
        attempt: u32,
    ) -> TickResult {
        let from = applied.status;
        if from != EnvironmentStatus::Pruning {
            applied.status = EnvironmentStatus::Pruning;
            self.registry.record_applied(id, applied.clone());
            self.emit(
                id,
                from,
                EnvironmentStatus::Pruning,
                &desired.revision,
                Outcome::Planned {
                    operations: applied.resource_set.len(),
                },
            );
            if from == EnvironmentStatus::Ready {
                self.publish_routes();
            }
            // Durable marker so a restart resumes pruning.
            self.write_checkpoint().await;
        }

        // Deletes run routing-first so no rule outlives its backend.
        let plan = ReconciliationPlan::prune(&applied.resource_set);
        let mut remaining = Vec::new();
        for op in &plan.ops {
            let resource = op.resource();
            if let Err(error) = self.apply_op(op).await {
                warn!(%error, resource = %resource, "Delete failed, will retry");
                remaining.push(resource.clone());
                continue;
            }
            match self.applier.exists(resource).await {
                Ok(false) => {}
                Ok(true) => remaining.push(resource.clone()),
                Err(error) => {
                    warn!(%error, resource = %resource, "Existence check failed, keeping resource queued");
                    remaining.push(resource.clone());
                }
            }
        }

        if !remaining.is_empty() {
            let to = self.failure_status(attempt, EnvironmentStatus::Pruning);
            let pending = remaining.len();
            applied.status = to;
            applied.resource_set = remaining;
            self.registry.record_applied(id, applied);
            self.emit(
                id,
                EnvironmentStatus::Pruning,
                to,
                &desired.revision,
                Outcome::Retrying {
                    error: format!("{pending} resource(s) not yet confirmed deleted"),
                },
            );
            return TickResult::Retry;
        }

        applied.status = EnvironmentStatus::Absent;
        applied.resource_set = Vec::new();
        self.registry.record_applied(id, applied);
        self.emit(
            id,
            EnvironmentStatus::Pruning,
            EnvironmentStatus::Absent,
            &desired.revision,
            Outcome::Pruned,
        );
        // A reopen held during pruning restarts the lifecycle in place.
        if let Some(next) = self.registry.begin_reopen(id) {
            info!(id = %id, revision = %next.revision, "Reopened while pruning, recreating");
            self.publish_routes();
            self.write_checkpoint().await;
            return TickResult::Again;
        }
        self.registry.forget(id);
        self.publish_routes();
        self.write_checkpoint().await;
        TickResult::Done
    }

    async fn apply_op(&self, op: &Op) -> Result<(), ApplyError> {
        debug!(op = %op, "Applying operation");
        match op {
            Op::Create(resource) => self.applier.create(resource).await,
            Op::Update(resource) => self.applier.update(resource).await,
            Op::Delete(resource) => self.applier.delete(resource).await,
        }
    }

    fn record_set(
        &self,
        id: CanaryId,
        current: &mut AppliedEnvironment,
        resource_set: HashMap<ResourceKey, ResourceObject>,
    ) {
        let mut resources: Vec<ResourceObject> = resource_set.into_values().collect();
        resources.sort_by(|a, b| (a.rank(), a.name.clone()).cmp(&(b.rank(), b.name.clone())));
        current.resource_set = resources;
        self.registry.record_applied(id, current.clone());
    }

    /// Degraded is reported only after the failure has repeated; earlier
    /// attempts keep the phase the environment was already in.
    fn failure_status(&self, attempt: u32, phase: EnvironmentStatus) -> EnvironmentStatus {
        if attempt + 1 >= self.config.reconcile.degraded_threshold {
            EnvironmentStatus::Degraded
        } else {
            phase
        }
    }

    fn emit(
        &self,
        id: CanaryId,
        from: EnvironmentStatus,
        to: EnvironmentStatus,
        revision: &str,
        outcome: Outcome,
    ) {
        info!(
            id = %id,
            from = ?from,
            to = ?to,
            revision = %revision,
            outcome = ?outcome,
            "Environment transition"
        );
        let _ = self.transitions.send(TransitionEvent {
            id,
            from,
            to,
            revision: revision.to_string(),
            outcome,
        });
    }

    fn publish_routes(&self) {
        let ready = self.registry.ready_ids();
        if let Ok(mut publisher) = self.publisher.lock() {
            publisher.publish(&ready);
        }
    }

    async fn write_checkpoint(&self) {
        if let Some(store) = &self.checkpoint {
            if let Err(error) = store.save(&self.registry.snapshot()).await {
                warn!(%error, "Failed to write state checkpoint");
            }
        }
    }

    /// Capped exponential backoff with full jitter across the top half of
    /// the interval, so many ids failing together do not retry together.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconcile.backoff_base_ms;
        let max = self.config.reconcile.backoff_max_ms;
        let exp = base
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1).min(16)))
            .min(max)
            .max(1);
        let jittered = rand::thread_rng().gen_range(exp / 2..=exp);
        Duration::from_millis(jittered)
    }
}
