//! Reconciliation pass tests
//!
//! These use fake scanners and stores to drive every branch of a pass
//! without a cloud account.

use super::*;
use crate::error::StoreError;
use crate::models::{
    CostPolicySpec, IdleInstancePolicy, Instance, OrphanedVolumePolicy, TaggingPolicy, Volume,
};
use crate::scanner::{async_trait, FileInventory, InventoryScannerFactory, RegionInventory};
use crate::store::InMemoryPolicyStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn volume(id: &str, state: &str) -> Volume {
    Volume {
        id: id.to_string(),
        state: state.to_string(),
        size_gib: 20,
        volume_type: "gp3".to_string(),
        created_at: None,
        tags: HashMap::new(),
    }
}

fn instance(id: &str, tag_pairs: &[(&str, &str)]) -> Instance {
    Instance {
        id: id.to_string(),
        state: "running".to_string(),
        instance_type: "m5.large".to_string(),
        launched_at: None,
        tags: tag_pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

fn spec(volumes: bool, instances: bool, tags: bool) -> CostPolicySpec {
    CostPolicySpec {
        region: "us-east-1".to_string(),
        scan_schedule: "0 * * * *".to_string(),
        orphaned_volumes: OrphanedVolumePolicy {
            enabled: volumes,
            auto_delete: true,
            max_age_days: 30,
        },
        idle_instances: IdleInstancePolicy {
            enabled: instances,
            cpu_threshold: 5.0,
            monitoring_days: 7,
            auto_stop: true,
        },
        tagging_policy: TaggingPolicy {
            enabled: tags,
            required_tags: vec!["owner".to_string()],
        },
    }
}

/// Scanner returning canned results and counting calls
struct FakeScanner {
    volumes: Result<Vec<Volume>, ScanError>,
    instances: Result<Vec<Instance>, ScanError>,
    untagged: Result<u64, ScanError>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    observer: Option<(Arc<InMemoryPolicyStore>, PolicyId)>,
    observed: Mutex<Vec<Phase>>,
}

impl FakeScanner {
    fn new() -> Self {
        Self {
            volumes: Ok(vec![volume("vol-1", "available"), volume("vol-2", "available")]),
            instances: Ok(vec![instance("i-1", &[("owner", "a")])]),
            untagged: Ok(4),
            calls: AtomicUsize::new(0),
            delay: None,
            observer: None,
            observed: Mutex::new(Vec::new()),
        }
    }

    fn failing_instances(mut self) -> Self {
        self.instances = Err(ScanError::query("DescribeInstances", "throttled"));
        self
    }

    fn all_failing(mut self) -> Self {
        self.volumes = Err(ScanError::query("DescribeVolumes", "timeout"));
        self.instances = Err(ScanError::query("DescribeInstances", "timeout"));
        self.untagged = Err(ScanError::query("DescribeInstances", "timeout"));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn observing(mut self, store: Arc<InMemoryPolicyStore>, id: PolicyId) -> Self {
        self.observer = Some((store, id));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn on_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((store, id)) = &self.observer {
            if let Some(status) = store.status(id) {
                self.observed.lock().unwrap().push(status.phase);
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Scanner for FakeScanner {
    fn region(&self) -> &str {
        "us-east-1"
    }

    async fn scan_orphaned_volumes(&self) -> Result<Vec<Volume>, ScanError> {
        self.on_call().await;
        self.volumes.clone()
    }

    async fn scan_idle_instances(&self) -> Result<Vec<Instance>, ScanError> {
        self.on_call().await;
        self.instances.clone()
    }

    async fn scan_untagged_resources(&self, _required_tags: &[String]) -> Result<u64, ScanError> {
        self.on_call().await;
        self.untagged.clone()
    }
}

/// Factory that hands out a shared fake scanner or fails
struct FakeFactory {
    scanner: Result<Arc<FakeScanner>, ScanError>,
}

impl FakeFactory {
    fn ok(scanner: Arc<FakeScanner>) -> Arc<Self> {
        Arc::new(Self {
            scanner: Ok(scanner),
        })
    }

    fn failing(err: ScanError) -> Arc<Self> {
        Arc::new(Self { scanner: Err(err) })
    }
}

#[async_trait]
impl ScannerFactory for FakeFactory {
    async fn connect(&self, _region: &str) -> Result<Arc<dyn Scanner>, ScanError> {
        match &self.scanner {
            Ok(scanner) => Ok(scanner.clone() as Arc<dyn Scanner>),
            Err(e) => Err(e.clone()),
        }
    }
}

/// Factory whose connection never completes
struct HangingFactory;

#[async_trait]
impl ScannerFactory for HangingFactory {
    async fn connect(&self, _region: &str) -> Result<Arc<dyn Scanner>, ScanError> {
        std::future::pending().await
    }
}

/// Store wrapper that fails the n-th status write (1-based)
struct FlakyStore {
    inner: Arc<InMemoryPolicyStore>,
    fail_on_write: usize,
    error: StoreError,
    writes: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: Arc<InMemoryPolicyStore>, fail_on_write: usize, error: StoreError) -> Self {
        Self {
            inner,
            fail_on_write,
            error,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PolicyStore for FlakyStore {
    async fn fetch(&self, id: &PolicyId) -> Result<Option<CostPolicy>, StoreError> {
        self.inner.fetch(id).await
    }

    async fn update_status(
        &self,
        id: &PolicyId,
        expected_version: u64,
        status: CostPolicyStatus,
    ) -> Result<u64, StoreError> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on_write {
            return Err(self.error.clone());
        }
        self.inner.update_status(id, expected_version, status).await
    }

    async fn list_ids(&self) -> Result<Vec<PolicyId>, StoreError> {
        self.inner.list_ids().await
    }
}

/// Current value of a per-policy gauge in the global registry
fn policy_gauge(name: &str, policy: &str) -> Option<i64> {
    prometheus::gather()
        .iter()
        .find(|family| family.get_name() == name)?
        .get_metric()
        .iter()
        .find(|metric| {
            metric
                .get_label()
                .iter()
                .any(|label| label.get_name() == "policy" && label.get_value() == policy)
        })
        .map(|metric| metric.get_gauge().get_value() as i64)
}

fn setup(spec: CostPolicySpec) -> (Arc<InMemoryPolicyStore>, PolicyId) {
    let store = Arc::new(InMemoryPolicyStore::new());
    let id = PolicyId::namespaced("finops", "default");
    store.apply(id.clone(), spec);
    (store, id)
}

fn reconciler(store: Arc<dyn PolicyStore>, factory: Arc<dyn ScannerFactory>) -> Reconciler {
    Reconciler::new(store, factory, ReconcileConfig::default())
}

#[tokio::test]
async fn test_all_disabled_yields_ready_with_zero_counts() {
    let (store, id) = setup(spec(false, false, false));
    let scanner = Arc::new(FakeScanner::new());
    let r = reconciler(store.clone(), FakeFactory::ok(scanner.clone()));

    let action = r.reconcile(&id).await.unwrap();

    assert_eq!(action, Action::Requeue(DEFAULT_REQUEUE_AFTER));
    let status = store.status(&id).unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert_eq!(status.message, READY_MESSAGE);
    assert_eq!(status.orphaned_volumes, 0);
    assert_eq!(status.idle_instances, 0);
    assert_eq!(status.untagged_resources, 0);
    assert_eq!(scanner.calls(), 0);
}

#[tokio::test]
async fn test_all_enabled_reports_counts() {
    let (store, id) = setup(spec(true, true, true));
    let scanner = Arc::new(FakeScanner::new());
    let r = reconciler(store.clone(), FakeFactory::ok(scanner.clone()));

    r.reconcile(&id).await.unwrap();

    let status = store.status(&id).unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert_eq!(status.orphaned_volumes, 2);
    assert_eq!(status.idle_instances, 1);
    assert_eq!(status.untagged_resources, 4);
    assert!(status.last_scan_time.is_some());
    assert!(status.total_savings.is_none());
    assert_eq!(scanner.calls(), 3);
}

#[tokio::test]
async fn test_scanner_init_failure_sets_failed_and_short_backoff() {
    let (store, id) = setup(spec(true, true, true));
    let factory = FakeFactory::failing(ScanError::NoCredentials("us-east-1".to_string()));
    let r = reconciler(store.clone(), factory);

    let action = r.reconcile(&id).await.unwrap();

    assert_eq!(action, Action::Requeue(DEFAULT_FAILURE_BACKOFF));
    assert!(DEFAULT_FAILURE_BACKOFF < DEFAULT_REQUEUE_AFTER);
    let status = store.status(&id).unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert!(status.message.contains("no credentials available"));
    assert_eq!(status.orphaned_volumes, 0);
}

#[tokio::test]
async fn test_scanner_init_failure_keeps_scanner_error_when_write_fails() {
    let (inner, id) = setup(spec(true, false, false));
    let store = Arc::new(FlakyStore::new(
        inner.clone(),
        1,
        StoreError::Unavailable("etcd down".to_string()),
    ));
    let factory = FakeFactory::failing(ScanError::InvalidRegion("moon-1".to_string()));
    let r = reconciler(store, factory);

    let err = r.reconcile(&id).await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::ScannerInit(ScanError::InvalidRegion(_))
    ));
    assert!(inner.status(&id).is_none());
}

#[tokio::test]
async fn test_failed_pass_keeps_previous_findings() {
    let store = Arc::new(InMemoryPolicyStore::new());
    let id = PolicyId::namespaced("finops", "ready-then-failed");
    store.apply(id.clone(), spec(true, false, false));

    let healthy = reconciler(store.clone(), FakeFactory::ok(Arc::new(FakeScanner::new())));
    healthy.reconcile(&id).await.unwrap();
    let ready = store.status(&id).unwrap();
    assert_eq!(ready.orphaned_volumes, 2);

    let failing = reconciler(
        store.clone(),
        FakeFactory::failing(ScanError::NoCredentials("us-east-1".to_string())),
    );
    failing.reconcile(&id).await.unwrap();

    let failed = store.status(&id).unwrap();
    assert_eq!(failed.phase, Phase::Failed);
    assert_eq!(failed.orphaned_volumes, 2);
    assert_eq!(failed.last_scan_time, ready.last_scan_time);
    assert_eq!(
        policy_gauge("cost_optimizer_orphaned_volumes", id.as_str()),
        Some(failed.orphaned_volumes as i64)
    );
}

#[tokio::test]
async fn test_scanning_status_keeps_previous_counts() {
    let (store, id) = setup(spec(true, false, false));
    let r = reconciler(store.clone(), FakeFactory::ok(Arc::new(FakeScanner::new())));
    r.reconcile(&id).await.unwrap();

    let flaky = Arc::new(FlakyStore::new(
        store.clone(),
        2,
        StoreError::Unavailable("timeout".to_string()),
    ));
    let r = reconciler(flaky, FakeFactory::ok(Arc::new(FakeScanner::new())));
    r.reconcile(&id).await.unwrap_err();

    let status = store.status(&id).unwrap();
    assert_eq!(status.phase, Phase::Scanning);
    assert_eq!(status.message, SCANNING_MESSAGE);
    assert_eq!(status.orphaned_volumes, 2);
}

#[tokio::test]
async fn test_failed_policy_recovers_on_next_pass() {
    let (store, id) = setup(spec(true, false, false));
    let failing = reconciler(
        store.clone(),
        FakeFactory::failing(ScanError::NoCredentials("us-east-1".to_string())),
    );
    failing.reconcile(&id).await.unwrap();
    assert_eq!(store.status(&id).unwrap().phase, Phase::Failed);

    let healthy = reconciler(store.clone(), FakeFactory::ok(Arc::new(FakeScanner::new())));
    healthy.reconcile(&id).await.unwrap();

    let status = store.status(&id).unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert_eq!(status.orphaned_volumes, 2);
}

#[tokio::test]
async fn test_partial_failure_still_ready() {
    let (store, id) = setup(spec(true, true, true));
    let scanner = Arc::new(FakeScanner::new().failing_instances());
    let r = reconciler(store.clone(), FakeFactory::ok(scanner.clone()));

    let action = r.reconcile(&id).await.unwrap();

    assert_eq!(action, Action::Requeue(DEFAULT_REQUEUE_AFTER));
    let status = store.status(&id).unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert_eq!(status.orphaned_volumes, 2);
    assert_eq!(status.idle_instances, 0);
    assert_eq!(status.untagged_resources, 4);
    assert_eq!(scanner.calls(), 3);
}

#[tokio::test]
async fn test_every_sub_scan_failing_is_still_ready() {
    let (store, id) = setup(spec(true, true, true));
    let scanner = Arc::new(FakeScanner::new().all_failing());
    let r = reconciler(store.clone(), FakeFactory::ok(scanner.clone()));

    r.reconcile(&id).await.unwrap();

    let status = store.status(&id).unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert_eq!(status.orphaned_volumes, 0);
    assert_eq!(status.idle_instances, 0);
    assert_eq!(status.untagged_resources, 0);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (store, id) = setup(spec(true, true, true));
    let r = reconciler(store.clone(), FakeFactory::ok(Arc::new(FakeScanner::new())));

    r.reconcile(&id).await.unwrap();
    let first = store.status(&id).unwrap();
    r.reconcile(&id).await.unwrap();
    let second = store.status(&id).unwrap();

    assert_eq!(first.phase, second.phase);
    assert_eq!(first.orphaned_volumes, second.orphaned_volumes);
    assert_eq!(first.idle_instances, second.idle_instances);
    assert_eq!(first.untagged_resources, second.untagged_resources);
    assert!(second.last_scan_time >= first.last_scan_time);
}

#[tokio::test]
async fn test_missing_policy_is_a_noop() {
    let store = Arc::new(InMemoryPolicyStore::new());
    let scanner = Arc::new(FakeScanner::new());
    let r = reconciler(store.clone(), FakeFactory::ok(scanner.clone()));

    let action = r.reconcile(&PolicyId::new("finops/gone")).await.unwrap();

    assert_eq!(action, Action::AwaitChange);
    assert_eq!(scanner.calls(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_scanning_status_visible_during_scan() {
    let (store, id) = setup(spec(true, true, false));
    let scanner = Arc::new(FakeScanner::new().observing(store.clone(), id.clone()));
    let r = reconciler(store.clone(), FakeFactory::ok(scanner.clone()));

    r.reconcile(&id).await.unwrap();

    let observed = scanner.observed.lock().unwrap().clone();
    assert_eq!(observed, vec![Phase::Scanning, Phase::Scanning]);
    assert_eq!(store.status(&id).unwrap().phase, Phase::Ready);
}

#[tokio::test]
async fn test_scanning_write_failure_aborts_before_scans() {
    let (inner, id) = setup(spec(true, true, true));
    let store = Arc::new(FlakyStore::new(
        inner.clone(),
        1,
        StoreError::Unavailable("connection refused".to_string()),
    ));
    let scanner = Arc::new(FakeScanner::new());
    let r = reconciler(store, FakeFactory::ok(scanner.clone()));

    let err = r.reconcile(&id).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Store(_)));
    assert_eq!(scanner.calls(), 0);
    assert!(inner.status(&id).is_none());
}

#[tokio::test]
async fn test_final_write_failure_is_returned() {
    let (inner, id) = setup(spec(true, false, false));
    let store = Arc::new(FlakyStore::new(
        inner.clone(),
        2,
        StoreError::Unavailable("timeout".to_string()),
    ));
    let r = reconciler(store, FakeFactory::ok(Arc::new(FakeScanner::new())));

    let err = r.reconcile(&id).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Store(_)));
    assert_eq!(inner.status(&id).unwrap().phase, Phase::Scanning);
}

#[tokio::test]
async fn test_concurrent_spec_change_is_retryable_conflict() {
    let (store, id) = setup(spec(true, false, false));
    let scanner = Arc::new(FakeScanner::new());
    let r = reconciler(store.clone(), FakeFactory::ok(scanner));

    // Spec edited after the pass read it
    let racing = FlakyStore::new(
        store.clone(),
        2,
        StoreError::Conflict {
            id: id.to_string(),
            expected: 2,
            actual: 3,
        },
    );
    let r_racing = Reconciler::new(
        Arc::new(racing),
        FakeFactory::ok(Arc::new(FakeScanner::new())),
        ReconcileConfig::default(),
    );

    let err = r_racing.reconcile(&id).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict(_)));
    assert!(err.is_retryable());

    // A fresh pass reads the new version and succeeds
    r.reconcile(&id).await.unwrap();
    assert_eq!(store.status(&id).unwrap().phase, Phase::Ready);
}

#[tokio::test]
async fn test_deadline_cancels_before_final_write() {
    let (store, id) = setup(spec(true, true, true));
    let scanner = Arc::new(FakeScanner::new().with_delay(Duration::from_secs(5)));
    let r = reconciler(store.clone(), FakeFactory::ok(scanner));

    let deadline = Instant::now() + Duration::from_millis(50);
    let err = r.reconcile_until(&id, Some(deadline)).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Cancelled));
    assert_eq!(store.status(&id).unwrap().phase, Phase::Scanning);
}

#[tokio::test]
async fn test_deadline_covers_scanner_construction() {
    let (store, id) = setup(spec(true, true, true));
    let r = reconciler(store.clone(), Arc::new(HangingFactory));

    let deadline = Instant::now() + Duration::from_millis(50);
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        r.reconcile_until(&id, Some(deadline)),
    )
    .await
    .expect("pass ignored its deadline");

    assert!(matches!(result, Err(ReconcileError::Cancelled)));
    assert!(store.status(&id).is_none());
}

#[tokio::test]
async fn test_last_scan_time_never_moves_backwards() {
    let (store, id) = setup(spec(false, false, false));
    let future = Utc::now() + chrono::Duration::hours(1);
    let version = store.fetch(&id).await.unwrap().unwrap().resource_version;
    store
        .update_status(
            &id,
            version,
            CostPolicyStatus {
                phase: Phase::Ready,
                last_scan_time: Some(future),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let r = reconciler(store.clone(), FakeFactory::ok(Arc::new(FakeScanner::new())));
    r.reconcile(&id).await.unwrap();

    assert!(store.status(&id).unwrap().last_scan_time.unwrap() >= future);
}

#[tokio::test]
async fn test_orphaned_volumes_and_tags_scenario() {
    let mut regions = HashMap::new();
    regions.insert(
        "us-east-1".to_string(),
        RegionInventory {
            volumes: vec![
                volume("vol-1", "available"),
                volume("vol-2", "available"),
                volume("vol-3", "available"),
                volume("vol-4", "in-use"),
            ],
            instances: vec![
                instance("i-1", &[("owner", "alice")]),
                instance("i-2", &[("env", "prod")]),
            ],
        },
    );
    let factory = Arc::new(InventoryScannerFactory::new(Arc::new(FileInventory::new(
        regions,
    ))));
    let (store, id) = setup(spec(true, false, true));
    let r = reconciler(store.clone(), factory);

    r.reconcile(&id).await.unwrap();

    let status = store.status(&id).unwrap();
    assert_eq!(status.orphaned_volumes, 3);
    assert_eq!(status.idle_instances, 0);
    assert_eq!(status.untagged_resources, 1);
    assert_eq!(status.phase, Phase::Ready);
}

#[test]
fn test_sub_scan_outcome_counts() {
    assert_eq!(SubScanOutcome::Disabled.count(), 0);
    assert_eq!(SubScanOutcome::Failed("boom".to_string()).count(), 0);
    assert_eq!(SubScanOutcome::Completed(7).count(), 7);
}

#[test]
fn test_scan_report_failed_scans() {
    let report = ScanReport {
        orphaned_volumes: SubScanOutcome::Completed(1),
        idle_instances: SubScanOutcome::Failed("throttled".to_string()),
        untagged_resources: SubScanOutcome::Disabled,
    };
    assert_eq!(report.failed_scans(), 1);
}
