//! Observability infrastructure for the cost policy controller
//!
//! Provides:
//! - Prometheus metrics (reconcile and sub-scan latency, pass outcomes, sub-scan errors,
//!   per-policy findings)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for reconcile latency (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0,
];

/// Histogram buckets for a single provider query (in seconds)
const SUB_SCAN_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    reconcile_duration_seconds: Histogram,
    reconciliations_total: IntCounterVec,
    sub_scan_duration_seconds: HistogramVec,
    sub_scan_errors_total: IntCounterVec,
    orphaned_volumes: IntGaugeVec,
    idle_instances: IntGaugeVec,
    untagged_resources: IntGaugeVec,
    inflight_reconciliations: IntGauge,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "cost_optimizer_reconcile_duration_seconds",
                "Time spent in a single reconciliation pass",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            reconciliations_total: register_int_counter_vec!(
                "cost_optimizer_reconciliations_total",
                "Reconciliation passes by result",
                &["result"]
            )
            .expect("Failed to register reconciliations_total"),

            sub_scan_duration_seconds: register_histogram_vec!(
                "cost_optimizer_sub_scan_duration_seconds",
                "Time spent in a single sub-scan by scan kind",
                &["scan"],
                SUB_SCAN_BUCKETS.to_vec()
            )
            .expect("Failed to register sub_scan_duration_seconds"),

            sub_scan_errors_total: register_int_counter_vec!(
                "cost_optimizer_sub_scan_errors_total",
                "Failed sub-scans by scan kind",
                &["scan"]
            )
            .expect("Failed to register sub_scan_errors_total"),

            orphaned_volumes: register_int_gauge_vec!(
                "cost_optimizer_orphaned_volumes",
                "Orphaned volumes found by the last completed pass",
                &["policy"]
            )
            .expect("Failed to register orphaned_volumes"),

            idle_instances: register_int_gauge_vec!(
                "cost_optimizer_idle_instances",
                "Idle instances found by the last completed pass",
                &["policy"]
            )
            .expect("Failed to register idle_instances"),

            untagged_resources: register_int_gauge_vec!(
                "cost_optimizer_untagged_resources",
                "Resources missing required tags in the last completed pass",
                &["policy"]
            )
            .expect("Failed to register untagged_resources"),

            inflight_reconciliations: register_int_gauge!(
                "cost_optimizer_inflight_reconciliations",
                "Reconciliation passes currently running"
            )
            .expect("Failed to register inflight_reconciliations"),
        }
    }
}

/// Outcome label for `cost_optimizer_reconciliations_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    Ready,
    Failed,
    NotFound,
    Error,
}

impl PassResult {
    fn as_label(&self) -> &'static str {
        match self {
            PassResult::Ready => "ready",
            PassResult::Failed => "failed",
            PassResult::NotFound => "not_found",
            PassResult::Error => "error",
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_reconcile_duration(&self, duration_secs: f64) {
        self.inner().reconcile_duration_seconds.observe(duration_secs);
    }

    pub fn inc_reconciliations(&self, result: PassResult) {
        self.inner()
            .reconciliations_total
            .with_label_values(&[result.as_label()])
            .inc();
    }

    pub fn observe_sub_scan_duration(&self, scan: &str, duration_secs: f64) {
        self.inner()
            .sub_scan_duration_seconds
            .with_label_values(&[scan])
            .observe(duration_secs);
    }

    pub fn inc_sub_scan_errors(&self, scan: &str) {
        self.inner()
            .sub_scan_errors_total
            .with_label_values(&[scan])
            .inc();
    }

    /// Publish the findings of a completed pass
    pub fn set_findings(&self, policy: &str, orphaned: u64, idle: u64, untagged: u64) {
        let inner = self.inner();
        inner
            .orphaned_volumes
            .with_label_values(&[policy])
            .set(orphaned as i64);
        inner
            .idle_instances
            .with_label_values(&[policy])
            .set(idle as i64);
        inner
            .untagged_resources
            .with_label_values(&[policy])
            .set(untagged as i64);
    }

    /// Drop per-policy series once a policy is gone
    pub fn remove_policy(&self, policy: &str) {
        let inner = self.inner();
        let _ = inner.orphaned_volumes.remove_label_values(&[policy]);
        let _ = inner.idle_instances.remove_label_values(&[policy]);
        let _ = inner.untagged_resources.remove_label_values(&[policy]);
    }

    pub fn set_inflight(&self, count: i64) {
        self.inner().inflight_reconciliations.set(count);
    }
}

/// Structured logger for controller events
///
/// Provides consistent JSON-formatted logging for scan results,
/// failures and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a completed scan
    pub fn log_scan_completed(
        &self,
        policy: &str,
        region: &str,
        orphaned_volumes: u64,
        idle_instances: u64,
        untagged_resources: u64,
        failed_scans: usize,
    ) {
        info!(
            event = "scan_completed",
            instance = %self.instance,
            policy = %policy,
            region = %region,
            orphaned_volumes = orphaned_volumes,
            idle_instances = idle_instances,
            untagged_resources = untagged_resources,
            failed_scans = failed_scans,
            "Cost policy scan completed"
        );
    }

    /// Log a sub-scan that failed and was recorded as zero
    pub fn log_sub_scan_failed(&self, policy: &str, region: &str, scan: &str, error: &str) {
        warn!(
            event = "sub_scan_failed",
            instance = %self.instance,
            policy = %policy,
            region = %region,
            scan = %scan,
            error = %error,
            "Sub-scan failed, reporting zero"
        );
    }

    /// Log a scanner that could not be created for a region
    pub fn log_scanner_init_failed(&self, policy: &str, region: &str, error: &str) {
        warn!(
            event = "scanner_init_failed",
            instance = %self.instance,
            policy = %policy,
            region = %region,
            error = %error,
            "Failed to create scanner"
        );
    }

    /// Log controller startup
    pub fn log_startup(&self, version: &str, policies: usize) {
        info!(
            event = "controller_started",
            instance = %self.instance,
            version = %version,
            policies = policies,
            "Cost policy controller started"
        );
    }

    /// Log controller shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Cost policy controller shutting down"
        );
    }
}
