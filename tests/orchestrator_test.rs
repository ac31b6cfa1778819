// Integration tests for the orchestration facade

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use vmbackup::chain::{
    BackupSchedule, BackupStatus, BackupType, CapabilityProbe, ChainError, CompletionReport,
    MemoryBackupStore, ProbeError, StorageBackend, WorkloadRef,
};
use vmbackup::compliance::{CompliancePolicy, ComplianceStatus, MemoryPolicyDirectory, PolicyAssignment};
use vmbackup::config::{CoreConfig, KeyHierarchyConfig, MasterKeySource};
use vmbackup::keys::{
    EncryptionScheme, EncryptionStrategy, KeyAlgorithm, KeyError, KeyTarget, MemoryKeyStore,
};
use vmbackup::orchestrator::{
    ApplyOutcome, BackupOrchestrator, ExecutionCollaborator, ExecutionError, ExecutionRequest,
    ManualClock,
};
use vmbackup::{CoreError, ErrorKind};

#[derive(Default)]
struct RecordingExecutor {
    requests: Mutex<Vec<ExecutionRequest>>,
    reject: AtomicBool,
}

#[async_trait]
impl ExecutionCollaborator for RecordingExecutor {
    async fn submit(&self, request: ExecutionRequest) -> Result<(), ExecutionError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ExecutionError::Rejected("queue full".to_string()));
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

struct AlwaysCapable;

#[async_trait]
impl CapabilityProbe for AlwaysCapable {
    async fn probe_incremental_capability(&self, _schedule: &BackupSchedule) -> Result<bool, ProbeError> {
        Ok(true)
    }
}

struct Harness {
    orchestrator: BackupOrchestrator,
    executor: Arc<RecordingExecutor>,
    clock: Arc<ManualClock>,
    policies: MemoryPolicyDirectory,
}

fn harness(keys: KeyHierarchyConfig) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let config = CoreConfig::new(MasterKeySource::Base64(STANDARD.encode([42u8; 32])))
        .with_keys(keys)
        .with_max_concurrent_ticks(2);
    let executor = Arc::new(RecordingExecutor::default());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap()));
    let policies = MemoryPolicyDirectory::new();

    let orchestrator = BackupOrchestrator::from_config(
        &config,
        Arc::new(MemoryKeyStore::new()),
        Arc::new(MemoryBackupStore::new()),
        Arc::new(AlwaysCapable),
        Arc::new(policies.clone()),
        executor.clone(),
        clock.clone(),
    )
    .expect("Failed to build orchestrator");

    Harness {
        orchestrator,
        executor,
        clock,
        policies,
    }
}

async fn register(h: &Harness, backend: StorageBackend, workload: WorkloadRef) -> BackupSchedule {
    let backend_id = backend.id.clone();
    h.orchestrator
        .register_storage_backend(&backend)
        .await
        .expect("Failed to register backend");
    h.orchestrator
        .register_schedule(BackupSchedule::new(workload, backend_id))
        .await
        .expect("Failed to register schedule")
}

fn report_for(backup_type: BackupType, tick: usize) -> CompletionReport {
    let report = CompletionReport::success().with_checkpoint(format!("cp-{}", tick));
    match backup_type {
        BackupType::Full => report,
        BackupType::Incremental => report.with_changed_blocks(64, 65536),
    }
}

#[tokio::test]
async fn test_rotation_does_not_rewrite_existing_backups() {
    let h = harness(KeyHierarchyConfig::default());
    let vm = WorkloadRef::Vm("vm-300".to_string());
    let schedule = register(&h, StorageBackend::new("nas", EncryptionStrategy::PerWorkload), vm.clone()).await;

    let mut backups = Vec::new();
    let mut first_key = None;
    for tick in 0..5 {
        let plan = h
            .orchestrator
            .plan_next_backup(schedule.id)
            .await
            .expect("Failed to plan backup");
        let key = plan.key.clone().expect("Encrypted backend must bind a key");
        assert_eq!(key.target, KeyTarget::Vm("vm-300".to_string()));
        first_key.get_or_insert(key.clone());
        h.orchestrator.dispatch(&plan).await.expect("Dispatch failed");
        h.orchestrator
            .apply_completion(plan.backup_id, &report_for(plan.backup_type, tick))
            .await
            .expect("Completion failed");
        backups.push(plan.backup_id);
        h.clock.advance(Duration::hours(1));
    }
    let v1 = first_key.unwrap();
    assert_eq!(v1.version, 1);

    let v2 = h
        .orchestrator
        .rotate_key(&KeyTarget::Vm("vm-300".to_string()))
        .await
        .expect("Rotation failed");
    assert_eq!(v2.version, 2);

    let next = h.orchestrator.plan_next_backup(schedule.id).await.unwrap();
    assert_eq!(next.key.as_ref().map(|k| k.key_id), Some(v2.id));

    for backup_id in &backups {
        let backup = h.orchestrator.planner().backup(*backup_id).await.unwrap();
        assert_eq!(backup.encryption_key_id, Some(v1.key_id));
        assert_eq!(backup.encryption_scheme, Some(EncryptionScheme::Vm));
    }

    let dek = h.orchestrator.unwrap_key(&v1).await.expect("Old key must stay readable");
    assert_eq!(dek.len(), KeyAlgorithm::Aes256Gcm.key_len());

    match h.orchestrator.delete_key(v1.key_id).await {
        Err(CoreError::Key(KeyError::KeyInUse { references, .. })) => assert_eq!(references, 5),
        other => panic!("Expected KeyInUse, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tick_plans_and_dispatches_due_schedules() {
    let h = harness(KeyHierarchyConfig::default());
    let disabled = StorageBackend::new("plain", EncryptionStrategy::Disabled);
    let a = register(&h, disabled.clone(), WorkloadRef::Vm("vm-a".into())).await;
    let b = register(&h, disabled.clone(), WorkloadRef::Container("ct-b".into())).await;
    let c = register(&h, disabled, WorkloadRef::Vm("vm-c".into())).await;

    let summary = h.orchestrator.run_tick().await.expect("Tick failed");
    assert_eq!(summary.planned.len(), 3);
    assert!(summary.failed.is_empty());

    let mut dispatched: Vec<_> = h.executor.requests.lock().unwrap().iter().map(|r| r.backup_id).collect();
    let mut planned: Vec<_> = summary.planned.iter().map(|p| p.backup_id).collect();
    dispatched.sort();
    planned.sort();
    assert_eq!(dispatched, planned);
    assert!(summary.planned.iter().all(|p| p.key.is_none()));

    let mut scheduled: Vec<_> = summary.planned.iter().map(|p| p.schedule_id).collect();
    let mut expected = vec![a.id, b.id, c.id];
    scheduled.sort();
    expected.sort();
    assert_eq!(scheduled, expected);

    // In-flight schedules are not due again.
    let again = h.orchestrator.run_tick().await.unwrap();
    assert!(again.planned.is_empty());
}

#[tokio::test]
async fn test_rejected_dispatch_fails_backup() {
    let h = harness(KeyHierarchyConfig::default());
    let schedule = register(
        &h,
        StorageBackend::new("plain", EncryptionStrategy::Disabled),
        WorkloadRef::Vm("vm-r".into()),
    )
    .await;
    h.executor.reject.store(true, Ordering::SeqCst);

    let summary = h.orchestrator.run_tick().await.unwrap();
    assert!(summary.planned.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, schedule.id);

    let schedule = h.orchestrator.planner().schedule(schedule.id).await.unwrap();
    assert_eq!(schedule.pending_backup_id, None);
    let history = h.orchestrator.planner().store().backups_for_schedule(schedule.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, BackupStatus::Failed);
    assert!(history[0].error_detail.as_deref().unwrap_or_default().contains("queue full"));
}

#[tokio::test]
async fn test_missing_key_fails_backup_without_fallback() {
    let h = harness(KeyHierarchyConfig::default().with_auto_create_keys(false));
    let schedule = register(
        &h,
        StorageBackend::new("vault", EncryptionStrategy::StorageBackend).with_global_fallback(false),
        WorkloadRef::Vm("vm-k".into()),
    )
    .await;

    let err = h.orchestrator.plan_next_backup(schedule.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Key(KeyError::KeyNotFound(_))));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let schedule = h.orchestrator.planner().schedule(schedule.id).await.unwrap();
    assert_eq!(schedule.pending_backup_id, None);
}

#[tokio::test]
async fn test_global_fallback_sets_global_scheme() {
    let h = harness(KeyHierarchyConfig::default().with_auto_create_keys(false));
    let global = h
        .orchestrator
        .keys()
        .create_key(&KeyTarget::Global, KeyAlgorithm::Aes256Gcm)
        .await
        .unwrap();
    let schedule = register(
        &h,
        StorageBackend::new("shared", EncryptionStrategy::PerWorkload),
        WorkloadRef::Container("ct-g".into()),
    )
    .await;

    let plan = h.orchestrator.plan_next_backup(schedule.id).await.unwrap();
    assert_eq!(plan.key.as_ref().map(|k| k.key_id), Some(global.id));
    let backup = h.orchestrator.planner().backup(plan.backup_id).await.unwrap();
    assert_eq!(backup.encryption_scheme, Some(EncryptionScheme::Global));
}

#[tokio::test]
async fn test_duplicate_report_is_ignored_and_compliance_refreshed() {
    let h = harness(KeyHierarchyConfig::default());
    let vm = WorkloadRef::Vm("vm-c".to_string());
    h.policies.set(
        vm.clone(),
        PolicyAssignment::Assigned(CompliancePolicy::new("hourly", 60)),
    );
    let schedule = register(&h, StorageBackend::new("plain", EncryptionStrategy::Disabled), vm.clone()).await;

    assert_eq!(
        h.orchestrator.get_compliance_status(&vm).await.unwrap().status,
        ComplianceStatus::Red
    );

    let plan = h.orchestrator.plan_next_backup(schedule.id).await.unwrap();
    let report = CompletionReport::success().with_checkpoint("cp-0");
    match h.orchestrator.apply_completion(plan.backup_id, &report).await.unwrap() {
        ApplyOutcome::Applied(backup) => assert_eq!(backup.status, BackupStatus::Completed),
        other => panic!("Expected Applied, got {:?}", other),
    }
    assert_eq!(
        h.orchestrator.cached_compliance(&vm).map(|r| r.status),
        Some(ComplianceStatus::Green)
    );

    match h.orchestrator.apply_failure(plan.backup_id, "late").await.unwrap() {
        ApplyOutcome::Ignored { backup_id, status } => {
            assert_eq!(backup_id, plan.backup_id);
            assert_eq!(status, BackupStatus::Completed);
        }
        other => panic!("Expected Ignored, got {:?}", other),
    }

    h.clock.advance(Duration::minutes(50));
    assert_eq!(
        h.orchestrator.get_compliance_status(&vm).await.unwrap().status,
        ComplianceStatus::Yellow
    );
}

#[tokio::test]
async fn test_unknown_backup_is_an_error() {
    let h = harness(KeyHierarchyConfig::default());
    let err = h
        .orchestrator
        .apply_completion(uuid::Uuid::new_v4(), &CompletionReport::success())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Chain(ChainError::BackupNotFound(_))));
}

#[tokio::test]
async fn test_key_export_round_trip_through_facade() {
    let h = harness(KeyHierarchyConfig::default());
    h.orchestrator.keys().create_key(&KeyTarget::Global, KeyAlgorithm::Aes256Gcm).await.unwrap();

    let export = h.orchestrator.export_keys().await.unwrap();
    let other = harness(KeyHierarchyConfig::default());
    let summary = other.orchestrator.import_keys(&export).await.unwrap();
    assert_eq!(summary.imported, 1);
    assert_eq!(summary.unknown_master_keys, 0);
}

fn restarted(config: &CoreConfig, key_store: Arc<MemoryKeyStore>) -> BackupOrchestrator {
    BackupOrchestrator::from_config(
        config,
        key_store,
        Arc::new(MemoryBackupStore::new()),
        Arc::new(AlwaysCapable),
        Arc::new(MemoryPolicyDirectory::new()),
        Arc::new(RecordingExecutor::default()),
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap())),
    )
    .expect("Failed to build orchestrator")
}

#[tokio::test]
async fn test_restart_after_master_key_rotation_needs_retired_key() {
    let old_source = MasterKeySource::Base64(STANDARD.encode([42u8; 32]));
    let new_source = MasterKeySource::Base64(STANDARD.encode([43u8; 32]));
    let key_store = Arc::new(MemoryKeyStore::new());

    let first = restarted(&CoreConfig::new(old_source.clone()), key_store.clone());
    let key = first
        .keys()
        .create_key(&KeyTarget::Vm("vm-200".into()), KeyAlgorithm::Aes256Gcm)
        .await
        .unwrap();
    let dek = first.unwrap_key(&key.handle()).await.unwrap().to_vec();
    first.rotate_master_key(new_source.load().unwrap()).await;

    let without_retired = restarted(&CoreConfig::new(new_source.clone()), key_store.clone());
    match without_retired.unwrap_key(&key.handle()).await {
        Err(CoreError::Key(KeyError::UnknownMasterKey(_))) => {}
        other => panic!("Expected UnknownMasterKey, got {:?}", other.map(|d| d.len())),
    }

    let config = CoreConfig::new(new_source.clone()).with_retired_master_key(old_source);
    let with_retired = restarted(&config, key_store.clone());
    assert_eq!(with_retired.unwrap_key(&key.handle()).await.unwrap().to_vec(), dek);

    // New DEKs are wrapped under the current key, not the retired one
    let fresh = with_retired
        .keys()
        .create_key(&KeyTarget::Vm("vm-201".into()), KeyAlgorithm::Aes256Gcm)
        .await
        .unwrap();
    assert_eq!(fresh.wrapped_key.master_key_id, new_source.load().unwrap().id());
}
