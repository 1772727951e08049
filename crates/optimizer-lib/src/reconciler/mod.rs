//! Cost policy reconciliation
//!
//! One pass fetches a policy, connects a scanner for its region, runs the
//! enabled sub-scans and writes the aggregated status back. A pass writes
//! `Scanning` before any scan work and `Ready` (or `Failed`) at the end;
//! nothing else touches the status.
//!
//! Sub-scans are best effort: a failing scan is logged and reported as zero
//! without stopping the others, and never turns the pass into `Failed`.

#[cfg(test)]
mod tests;

use crate::error::{ReconcileError, ScanError, StoreError};
use crate::models::{CostPolicy, CostPolicyStatus, Phase, PolicyId};
use crate::observability::{ControllerMetrics, PassResult, StructuredLogger};
use crate::scanner::{Scanner, ScannerFactory};
use crate::store::PolicyStore;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Delay before the next pass after a completed one
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Delay before retrying after the scanner could not be created
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(10 * 60);

pub const SCANNING_MESSAGE: &str = "scan in progress";
pub const READY_MESSAGE: &str = "scan completed successfully";

/// What the dispatcher should do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run the policy again after the given delay
    Requeue(Duration),
    /// Nothing to do until the policy changes (it no longer exists)
    AwaitChange,
}

/// Timing policy of the reconciler
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub requeue_after: Duration,
    pub failure_backoff: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            requeue_after: DEFAULT_REQUEUE_AFTER,
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        }
    }
}

/// Result of a single sub-scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubScanOutcome {
    /// Turned off in the policy spec, not attempted
    Disabled,
    Completed(u64),
    Failed(String),
}

impl SubScanOutcome {
    /// Count reported in the status; zero unless the scan completed
    pub fn count(&self) -> u64 {
        match self {
            SubScanOutcome::Completed(n) => *n,
            SubScanOutcome::Disabled | SubScanOutcome::Failed(_) => 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SubScanOutcome::Failed(_))
    }
}

/// Per-scan outcomes of one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub orphaned_volumes: SubScanOutcome,
    pub idle_instances: SubScanOutcome,
    pub untagged_resources: SubScanOutcome,
}

impl ScanReport {
    pub fn failed_scans(&self) -> usize {
        [
            &self.orphaned_volumes,
            &self.idle_instances,
            &self.untagged_resources,
        ]
        .iter()
        .filter(|o| o.is_failed())
        .count()
    }

    fn ready_status(&self, last_scan_time: DateTime<Utc>) -> CostPolicyStatus {
        CostPolicyStatus {
            phase: Phase::Ready,
            message: READY_MESSAGE.to_string(),
            last_scan_time: Some(last_scan_time),
            orphaned_volumes: self.orphaned_volumes.count(),
            idle_instances: self.idle_instances.count(),
            untagged_resources: self.untagged_resources.count(),
            total_savings: None,
        }
    }
}

/// Reconciles cost policies against the live state of a region
pub struct Reconciler {
    store: Arc<dyn PolicyStore>,
    scanners: Arc<dyn ScannerFactory>,
    config: ReconcileConfig,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        scanners: Arc<dyn ScannerFactory>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            scanners,
            config,
            metrics: ControllerMetrics::new(),
            logger: StructuredLogger::new("reconciler"),
        }
    }

    /// Set the logger used for structured events
    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Identities of every policy currently in the store
    pub async fn known_policies(&self) -> Result<Vec<PolicyId>, StoreError> {
        self.store.list_ids().await
    }

    /// Run one reconciliation pass for a policy
    pub async fn reconcile(&self, id: &PolicyId) -> Result<Action, ReconcileError> {
        self.reconcile_until(id, None).await
    }

    /// Run one pass, giving up once `deadline` passes
    ///
    /// The deadline covers every step of the pass, including the policy read
    /// and scanner construction. A pass cancelled after its `Scanning` write
    /// leaves that status in place; the next pass overwrites it.
    pub async fn reconcile_until(
        &self,
        id: &PolicyId,
        deadline: Option<Instant>,
    ) -> Result<Action, ReconcileError> {
        let start = Instant::now();
        info!(policy = %id, "Starting reconciliation");

        let result = with_deadline(deadline, self.run_pass(id)).await;

        self.metrics
            .observe_reconcile_duration(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            self.metrics.inc_reconciliations(PassResult::Error);
            error!(policy = %id, error = %e, "Reconciliation failed");
        }

        result
    }

    async fn run_pass(&self, id: &PolicyId) -> Result<Action, ReconcileError> {
        let policy = match self.store.fetch(id).await? {
            Some(policy) => policy,
            None => {
                info!(policy = %id, "Cost policy not found, may have been deleted");
                self.metrics.inc_reconciliations(PassResult::NotFound);
                self.metrics.remove_policy(id.as_str());
                return Ok(Action::AwaitChange);
            }
        };

        let region = policy.spec.region.clone();
        debug!(
            policy = %id,
            region = %region,
            version = policy.resource_version,
            "Fetched cost policy"
        );

        let scanner = match self.scanners.connect(&region).await {
            Ok(scanner) => scanner,
            Err(e) => return self.fail_scanner_init(&policy, e).await,
        };

        let scan_time = next_scan_time(policy.status.as_ref());
        let mut scanning = policy.status.clone().unwrap_or_default();
        scanning.phase = Phase::Scanning;
        scanning.message = SCANNING_MESSAGE.to_string();
        scanning.last_scan_time = Some(scan_time);
        let version = self
            .store
            .update_status(id, policy.resource_version, scanning)
            .await
            .map_err(|e| {
                error!(policy = %id, error = %e, "Failed to update status to Scanning phase");
                ReconcileError::from(e)
            })?;

        let report = self.run_scans(&policy, scanner.as_ref()).await;

        let status = report.ready_status(scan_time);
        info!(
            policy = %id,
            orphaned = status.orphaned_volumes,
            idle = status.idle_instances,
            untagged = status.untagged_resources,
            "Updating final status"
        );
        self.store
            .update_status(id, version, status.clone())
            .await
            .map_err(|e| {
                error!(policy = %id, error = %e, "Failed to update final status");
                ReconcileError::from(e)
            })?;

        self.metrics.inc_reconciliations(PassResult::Ready);
        self.metrics.set_findings(
            id.as_str(),
            status.orphaned_volumes,
            status.idle_instances,
            status.untagged_resources,
        );
        self.logger.log_scan_completed(
            id.as_str(),
            &region,
            status.orphaned_volumes,
            status.idle_instances,
            status.untagged_resources,
            report.failed_scans(),
        );

        Ok(Action::Requeue(self.config.requeue_after))
    }

    /// Record a scanner construction failure and back off
    ///
    /// If the `Failed` status cannot be written the scanner error stays the
    /// controlling error of the pass.
    async fn fail_scanner_init(
        &self,
        policy: &CostPolicy,
        err: ScanError,
    ) -> Result<Action, ReconcileError> {
        let id = &policy.id;
        self.logger
            .log_scanner_init_failed(id.as_str(), &policy.spec.region, &err.to_string());

        // Counts and lastScanTime of the previous pass are kept
        let mut failed = policy.status.clone().unwrap_or_default();
        failed.phase = Phase::Failed;
        failed.message = format!("Failed to create scanner: {}", err);

        if let Err(write_err) = self
            .store
            .update_status(id, policy.resource_version, failed)
            .await
        {
            error!(
                policy = %id,
                error = %write_err,
                "Failed to update status after scanner creation failure"
            );
            return Err(ReconcileError::ScannerInit(err));
        }

        self.metrics.inc_reconciliations(PassResult::Failed);
        Ok(Action::Requeue(self.config.failure_backoff))
    }

    /// Run the enabled sub-scans in order: volumes, instances, tags
    async fn run_scans(&self, policy: &CostPolicy, scanner: &dyn Scanner) -> ScanReport {
        let spec = &policy.spec;

        let region = scanner.region();

        let orphaned_volumes = self
            .sub_scan(policy, region, "volumes", spec.orphaned_volumes.enabled, async {
                scanner.scan_orphaned_volumes().await.map(|v| v.len() as u64)
            })
            .await;

        let idle_instances = self
            .sub_scan(policy, region, "instances", spec.idle_instances.enabled, async {
                scanner.scan_idle_instances().await.map(|i| i.len() as u64)
            })
            .await;

        let required_tags = &spec.tagging_policy.required_tags;
        let untagged_resources = self
            .sub_scan(policy, region, "tags", spec.tagging_policy.enabled, async {
                scanner.scan_untagged_resources(required_tags).await
            })
            .await;

        ScanReport {
            orphaned_volumes,
            idle_instances,
            untagged_resources,
        }
    }

    async fn sub_scan<F>(
        &self,
        policy: &CostPolicy,
        region: &str,
        scan: &'static str,
        enabled: bool,
        query: F,
    ) -> SubScanOutcome
    where
        F: Future<Output = Result<u64, ScanError>>,
    {
        if !enabled {
            return SubScanOutcome::Disabled;
        }

        debug!(policy = %policy.id, region = %region, scan, "Running sub-scan");
        let start = Instant::now();
        let result = query.await;
        self.metrics
            .observe_sub_scan_duration(scan, start.elapsed().as_secs_f64());

        match result {
            Ok(count) => {
                debug!(policy = %policy.id, scan, count, "Sub-scan completed");
                SubScanOutcome::Completed(count)
            }
            Err(e) => {
                self.metrics.inc_sub_scan_errors(scan);
                self.logger
                    .log_sub_scan_failed(policy.id.as_str(), region, scan, &e.to_string());
                SubScanOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Await `fut`, failing with [`ReconcileError::Cancelled`] once `deadline` passes
async fn with_deadline<F, T>(deadline: Option<Instant>, fut: F) -> Result<T, ReconcileError>
where
    F: Future<Output = Result<T, ReconcileError>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .unwrap_or(Err(ReconcileError::Cancelled)),
        None => fut.await,
    }
}

/// Scan timestamp that never moves backwards for a policy
fn next_scan_time(previous: Option<&CostPolicyStatus>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous.and_then(|s| s.last_scan_time) {
        Some(last) if last > now => last,
        _ => now,
    }
}
