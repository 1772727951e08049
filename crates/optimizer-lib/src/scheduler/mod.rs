//! Reconciliation dispatch
//!
//! Holds `(policy, next fire time)` pairs and hands due policies to a bounded
//! pool of workers. Different policies reconcile concurrently; a single policy
//! never has more than one pass in flight. Policy create/update events trigger
//! an immediate pass; after each pass the returned [`Action`] or the error
//! policy decides when the policy fires again.

mod queue;


pub use queue::ScheduleQueue;

use crate::error::ReconcileError;
use crate::health::{components, HealthRegistry};
use crate::models::PolicyId;
use crate::observability::ControllerMetrics;
use crate::reconciler::{Action, Reconciler};
use crate::store::PolicyEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum passes running at once across all policies
    pub workers: usize,
    /// Deadline for a single pass
    pub pass_timeout: Duration,
    /// Delay before retrying a pass that hit a write conflict
    pub conflict_retry: Duration,
    /// Delay before retrying a pass that failed for any other reason
    pub error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            pass_timeout: Duration::from_secs(300),
            conflict_retry: Duration::from_secs(5),
            error_backoff: Duration::from_secs(30),
        }
    }
}

/// How a spawned pass ended
#[derive(Debug)]
enum PassCompletion {
    Finished(Result<Action, ReconcileError>),
    /// The pass task panicked or was aborted
    Crashed(String),
}

/// Dispatches reconciliation passes for all policies
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    config: SchedulerConfig,
    health: HealthRegistry,
    metrics: ControllerMetrics,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, config: SchedulerConfig) -> Self {
        Self {
            reconciler,
            config,
            health: HealthRegistry::new(),
            metrics: ControllerMetrics::new(),
        }
    }

    /// Report component health into a shared registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    /// Delay before retrying a pass that ended with `err`
    pub fn error_delay(&self, err: &ReconcileError) -> Duration {
        match err {
            ReconcileError::ScannerInit(_) => self.reconciler.config().failure_backoff,
            ReconcileError::Conflict(_) => self.config.conflict_retry,
            ReconcileError::Store(_) | ReconcileError::Cancelled => self.config.error_backoff,
        }
    }

    /// Delay before the next pass, or `None` if the policy should not fire again
    fn next_delay(&self, result: &Result<Action, ReconcileError>) -> Option<Duration> {
        match result {
            Ok(Action::Requeue(delay)) => Some(*delay),
            Ok(Action::AwaitChange) => None,
            Err(e) => Some(self.error_delay(e)),
        }
    }

    /// Reconcile every known policy once, one after another
    pub async fn run_once(
        &self,
    ) -> Result<Vec<(PolicyId, Result<Action, ReconcileError>)>, ReconcileError> {
        let ids = self.reconciler.known_policies().await?;
        let mut results = Vec::with_capacity(ids.len());

        for id in ids {
            let deadline = Instant::now() + self.config.pass_timeout;
            let result = self.reconciler.reconcile_until(&id, Some(deadline)).await;
            results.push((id, result));
        }

        Ok(results)
    }

    /// Run the dispatch loop until `shutdown` fires
    ///
    /// Every policy in the store is scheduled immediately on start. Passes
    /// still running at shutdown are aborted before their final status write.
    pub async fn run(
        self,
        mut events: broadcast::Receiver<PolicyEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let workers = self.config.workers.max(1);
        info!(workers, "Starting reconciliation scheduler");

        let mut queue = ScheduleQueue::new();
        let mut tasks: JoinSet<(PolicyId, PassCompletion)> = JoinSet::new();
        let mut events_open = true;

        match self.reconciler.known_policies().await {
            Ok(ids) => {
                let now = Instant::now();
                for id in ids {
                    queue.schedule(id, now);
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to list policies at startup");
                self.health
                    .set_degraded(components::POLICY_STORE, e.to_string())
                    .await;
            }
        }
        self.health.set_healthy(components::SCHEDULER).await;

        loop {
            self.dispatch_due(&mut queue, &mut tasks, workers);

            // With every worker busy only a completion can make progress
            let next_fire = if tasks.len() < workers {
                queue.next_fire_time()
            } else {
                None
            };

            tokio::select! {
                _ = sleep_until_next(next_fire) => {}
                event = events.recv(), if events_open => match event {
                    Ok(PolicyEvent::Applied(id)) => {
                        debug!(policy = %id, "Policy applied, scheduling reconciliation");
                        queue.schedule(id, Instant::now());
                    }
                    Ok(PolicyEvent::Deleted(id)) => {
                        debug!(policy = %id, "Policy deleted, dropping schedule");
                        queue.cancel(&id);
                        self.metrics.remove_policy(id.as_str());
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed policy events, rescheduling all policies");
                        self.resync(&mut queue).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Policy event stream closed, continuing on timers only");
                        events_open = false;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((id, completion)) => {
                            self.handle_completion(&mut queue, id, completion).await
                        }
                        Err(e) => error!(error = %e, "Reconciliation worker failed"),
                    }
                    self.metrics.set_inflight(tasks.len() as i64);
                }
                _ = shutdown.recv() => {
                    info!(in_flight = tasks.len(), "Shutting down reconciliation scheduler");
                    break;
                }
            }
        }

        tasks.shutdown().await;
        self.metrics.set_inflight(0);
    }

    fn dispatch_due(
        &self,
        queue: &mut ScheduleQueue,
        tasks: &mut JoinSet<(PolicyId, PassCompletion)>,
        workers: usize,
    ) {
        let capacity = workers.saturating_sub(tasks.len());
        if capacity == 0 {
            return;
        }

        for id in queue.pop_due(Instant::now(), capacity) {
            let reconciler = self.reconciler.clone();
            let deadline = Instant::now() + self.config.pass_timeout;
            let pass_id = id.clone();

            tasks.spawn(async move {
                // Run the pass in its own task so a panic still reports the policy id
                let pass = tokio::spawn(async move {
                    reconciler.reconcile_until(&pass_id, Some(deadline)).await
                });
                let abort = pass.abort_handle();
                let _guard = AbortOnDrop(abort);

                let completion = match pass.await {
                    Ok(result) => PassCompletion::Finished(result),
                    Err(e) => PassCompletion::Crashed(e.to_string()),
                };
                (id, completion)
            });
        }

        self.metrics.set_inflight(tasks.len() as i64);
    }

    async fn handle_completion(
        &self,
        queue: &mut ScheduleQueue,
        id: PolicyId,
        completion: PassCompletion,
    ) {
        queue.complete(&id);

        let result = match completion {
            PassCompletion::Finished(result) => result,
            PassCompletion::Crashed(reason) => {
                error!(policy = %id, reason = %reason, "Reconciliation pass crashed");
                self.health
                    .set_degraded(components::RECONCILER, format!("pass for {} crashed", id))
                    .await;
                queue.schedule(id, Instant::now() + self.config.error_backoff);
                return;
            }
        };

        self.record_health(&result).await;

        match self.next_delay(&result) {
            Some(delay) => {
                debug!(policy = %id, delay_secs = delay.as_secs(), "Requeueing policy");
                queue.schedule(id, Instant::now() + delay);
            }
            None => debug!(policy = %id, "Policy gone, not requeueing"),
        }
    }

    async fn record_health(&self, result: &Result<Action, ReconcileError>) {
        match result {
            Ok(_) => {
                self.health.set_healthy(components::POLICY_STORE).await;
                self.health.set_healthy(components::RECONCILER).await;
            }
            Err(ReconcileError::Store(e)) => {
                self.health
                    .set_degraded(components::POLICY_STORE, e.to_string())
                    .await;
            }
            Err(e) => {
                self.health
                    .set_degraded(components::RECONCILER, e.to_string())
                    .await;
            }
        }
    }

    async fn resync(&self, queue: &mut ScheduleQueue) {
        match self.reconciler.known_policies().await {
            Ok(ids) => {
                let now = Instant::now();
                for id in ids {
                    queue.schedule(id, now);
                }
            }
            Err(e) => warn!(error = %e, "Failed to list policies for resync"),
        }
    }
}

/// Aborts the inner pass when the worker task itself is aborted
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn sleep_until_next(next: Option<Instant>) {
    match next {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
