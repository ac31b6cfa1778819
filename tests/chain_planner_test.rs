// Integration tests for backup chain planning and outcome application

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc, Weekday};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use vmbackup::chain::{
    BackupModePolicy, BackupSchedule, BackupStatus, BackupStore, BackupType, Capability,
    CapabilityProbe, ChainError, ChainPlanner, CompletionReport, FreezeStatus, MemoryBackupStore,
    PlanReason, ProbeError, StorageBackend, VerificationReport, VerificationStatus, WorkloadRef,
};
use vmbackup::config::{KeyHierarchyConfig, PlannerConfig};
use vmbackup::keys::{
    EncryptionStrategy, KeyAlgorithm, KeyHierarchy, KeyTarget, MasterKey, MemoryKeyStore,
};

/// Probe whose answer the test controls.
struct ScriptedProbe {
    answer: Mutex<Result<bool, String>>,
}

impl ScriptedProbe {
    fn new(capable: bool) -> Arc<Self> {
        Arc::new(Self {
            answer: Mutex::new(Ok(capable)),
        })
    }

    fn set(&self, answer: Result<bool, String>) {
        *self.answer.lock().unwrap() = answer;
    }
}

#[async_trait]
impl CapabilityProbe for ScriptedProbe {
    async fn probe_incremental_capability(&self, _schedule: &BackupSchedule) -> Result<bool, ProbeError> {
        self.answer.lock().unwrap().clone().map_err(ProbeError)
    }
}

fn start() -> DateTime<Utc> {
    // A Monday
    Utc.with_ymd_and_hms(2026, 10, 19, 1, 0, 0).unwrap()
}

async fn setup(
    schedule: BackupSchedule,
    probe: Arc<ScriptedProbe>,
    config: PlannerConfig,
) -> (ChainPlanner, Arc<MemoryBackupStore>, Uuid) {
    let store = Arc::new(MemoryBackupStore::new());
    let planner = ChainPlanner::new(store.clone(), probe, config);
    planner
        .register_storage_backend(&StorageBackend::new("nas", EncryptionStrategy::Disabled))
        .await
        .expect("Failed to register storage backend");
    let schedule = planner
        .register_schedule(schedule)
        .await
        .expect("Failed to register schedule");
    (planner, store, schedule.id)
}

fn vm_schedule() -> BackupSchedule {
    BackupSchedule::new(WorkloadRef::Vm("vm-100".to_string()), "nas")
}

fn full_done(checkpoint: &str) -> CompletionReport {
    CompletionReport::success()
        .with_checkpoint(checkpoint)
        .with_consistency(true, FreezeStatus::Frozen)
}

fn incremental_done(checkpoint: &str) -> CompletionReport {
    CompletionReport::success()
        .with_checkpoint(checkpoint)
        .with_changed_blocks(128, 65536)
}

#[tokio::test]
async fn test_chain_cycles_through_max_length() {
    let (planner, _store, schedule_id) = setup(
        vm_schedule().with_max_chain_length(3),
        ScriptedProbe::new(true),
        PlannerConfig::default(),
    )
    .await;

    let mut now = start();
    let mut observed = Vec::new();
    let mut first_full = None;

    for tick in 0..5 {
        let plan = planner
            .plan_next_backup(schedule_id, now)
            .await
            .expect("Failed to plan backup");
        observed.push((plan.backup_type, plan.reason));

        let report = match plan.backup_type {
            BackupType::Full => {
                first_full.get_or_insert(plan.backup_id);
                full_done(&format!("cp-{}", tick))
            }
            BackupType::Incremental => {
                assert_eq!(plan.anchor_backup_id, first_full);
                assert_eq!(plan.checkpoint_baseline, Some(format!("cp-{}", tick - 1)));
                incremental_done(&format!("cp-{}", tick))
            }
        };
        planner
            .apply_completion(plan.backup_id, &report, now + Duration::minutes(10))
            .await
            .expect("Failed to apply completion");
        now += Duration::hours(1);
    }

    assert_eq!(
        observed,
        vec![
            (BackupType::Full, PlanReason::NoChain),
            (BackupType::Incremental, PlanReason::ContinueChain),
            (BackupType::Incremental, PlanReason::ContinueChain),
            (BackupType::Incremental, PlanReason::ContinueChain),
            (BackupType::Full, PlanReason::ChainLengthReached),
        ]
    );

    let schedule = planner.schedule(schedule_id).await.unwrap();
    assert_eq!(schedule.incremental_count, 0);
    assert_eq!(schedule.checkpoint_name.as_deref(), Some("cp-4"));
    assert_ne!(schedule.last_full_backup_id, first_full);
}

#[tokio::test]
async fn test_probe_failure_forces_full_with_unknown_capability() {
    let probe = ScriptedProbe::new(true);
    let (planner, _store, schedule_id) = setup(
        vm_schedule(),
        probe.clone(),
        PlannerConfig::default().with_capability_staleness(Duration::zero()),
    )
    .await;
    let now = start();

    let full = planner.plan_next_backup(schedule_id, now).await.unwrap();
    planner.apply_completion(full.backup_id, &full_done("cp-0"), now).await.unwrap();

    probe.set(Err("hypervisor timeout".to_string()));
    let later = now + Duration::hours(1);
    let plan = planner.plan_next_backup(schedule_id, later).await.unwrap();

    assert_eq!(plan.backup_type, BackupType::Full);
    assert_eq!(plan.reason, PlanReason::CapabilityUnknown);
    let schedule = planner.schedule(schedule_id).await.unwrap();
    assert_eq!(schedule.capability, Capability::Unknown);
    assert_eq!(schedule.capability_checked_at, Some(later));
}

#[tokio::test]
async fn test_capability_lost_mid_chain() {
    let probe = ScriptedProbe::new(true);
    let (planner, _store, schedule_id) = setup(
        vm_schedule().with_policy(BackupModePolicy::IncrementalPreferred),
        probe.clone(),
        PlannerConfig::default().with_capability_staleness(Duration::zero()),
    )
    .await;
    let now = start();

    let full = planner.plan_next_backup(schedule_id, now).await.unwrap();
    planner.apply_completion(full.backup_id, &full_done("cp-0"), now).await.unwrap();

    probe.set(Ok(false));
    let plan = planner
        .plan_next_backup(schedule_id, now + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(plan.reason, PlanReason::CapabilityLost);
    planner
        .apply_completion(plan.backup_id, &full_done("cp-1"), now + Duration::hours(1))
        .await
        .unwrap();

    let plan = planner
        .plan_next_backup(schedule_id, now + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(plan.reason, PlanReason::Incapable);
}

#[tokio::test]
async fn test_full_only_policy_never_probes() {
    let probe = ScriptedProbe::new(true);
    probe.set(Err("should not be called".into()));
    let (planner, _store, schedule_id) = setup(
        vm_schedule().with_policy(BackupModePolicy::FullOnly),
        probe,
        PlannerConfig::default(),
    )
    .await;

    let plan = planner.plan_next_backup(schedule_id, start()).await.unwrap();
    assert_eq!(plan.reason, PlanReason::FullOnlyPolicy);
    let schedule = planner.schedule(schedule_id).await.unwrap();
    assert_eq!(schedule.capability_checked_at, None);
}

#[tokio::test]
async fn test_weekly_full_day() {
    let (planner, _store, schedule_id) = setup(
        vm_schedule().with_full_backup_day(Weekday::Tue),
        ScriptedProbe::new(true),
        PlannerConfig::default(),
    )
    .await;
    let monday = start();

    let full = planner.plan_next_backup(schedule_id, monday).await.unwrap();
    planner.apply_completion(full.backup_id, &full_done("cp-0"), monday).await.unwrap();

    let plan = planner
        .plan_next_backup(schedule_id, monday + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(plan.backup_type, BackupType::Full);
    assert_eq!(plan.reason, PlanReason::FullBackupDay);
}

#[tokio::test]
async fn test_full_backup_day_takes_one_full() {
    let (planner, _store, schedule_id) = setup(
        vm_schedule().with_full_backup_day(Weekday::Tue),
        ScriptedProbe::new(true),
        PlannerConfig::default(),
    )
    .await;
    let monday = start();
    let full = planner.plan_next_backup(schedule_id, monday).await.unwrap();
    planner.apply_completion(full.backup_id, &full_done("cp-0"), monday).await.unwrap();

    let tuesday = monday + Duration::days(1);
    let weekly = planner.plan_next_backup(schedule_id, tuesday).await.unwrap();
    assert_eq!(weekly.reason, PlanReason::FullBackupDay);
    planner.apply_completion(weekly.backup_id, &full_done("cp-1"), tuesday).await.unwrap();

    let later = tuesday + Duration::hours(1);
    let plan = planner.plan_next_backup(schedule_id, later).await.unwrap();
    assert_eq!(plan.backup_type, BackupType::Incremental);
    assert_eq!(plan.reason, PlanReason::ContinueChain);
    assert_eq!(plan.anchor_backup_id, Some(weekly.backup_id));
    assert_eq!(plan.checkpoint_baseline.as_deref(), Some("cp-1"));
    planner
        .apply_completion(plan.backup_id, &incremental_done("cp-2"), later)
        .await
        .unwrap();

    let next_week = tuesday + Duration::days(7);
    let plan = planner.plan_next_backup(schedule_id, next_week).await.unwrap();
    assert_eq!(plan.reason, PlanReason::FullBackupDay);
}

/// Counts how often the planner asks about incremental support.
struct CountingProbe {
    calls: AtomicUsize,
}

#[async_trait]
impl CapabilityProbe for CountingProbe {
    async fn probe_incremental_capability(&self, _schedule: &BackupSchedule) -> Result<bool, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[tokio::test]
async fn test_capability_answer_is_cached_until_stale() {
    let counting = Arc::new(CountingProbe {
        calls: AtomicUsize::new(0),
    });
    let store = Arc::new(MemoryBackupStore::new());
    let planner = ChainPlanner::new(store, counting.clone(), PlannerConfig::default());
    planner
        .register_storage_backend(&StorageBackend::new("nas", EncryptionStrategy::Disabled))
        .await
        .unwrap();
    let schedule_id = planner.register_schedule(vm_schedule()).await.unwrap().id;
    let t0 = start();

    let full = planner.plan_next_backup(schedule_id, t0).await.unwrap();
    assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    planner.apply_completion(full.backup_id, &full_done("cp-0"), t0).await.unwrap();

    let t1 = t0 + Duration::hours(1);
    let inc = planner.plan_next_backup(schedule_id, t1).await.unwrap();
    assert_eq!(inc.backup_type, BackupType::Incremental);
    assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    planner.apply_completion(inc.backup_id, &incremental_done("cp-1"), t1).await.unwrap();

    // Default staleness is 24 hours
    let t2 = t0 + Duration::hours(25);
    let plan = planner.plan_next_backup(schedule_id, t2).await.unwrap();
    assert_eq!(plan.backup_type, BackupType::Incremental);
    assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    assert_eq!(planner.schedule(schedule_id).await.unwrap().capability_checked_at, Some(t2));
}

#[tokio::test]
async fn test_completion_is_idempotent() {
    let (planner, _store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;
    let now = start();

    let plan = planner.plan_next_backup(schedule_id, now).await.unwrap();
    let backup = planner
        .apply_completion(plan.backup_id, &full_done("cp-0"), now)
        .await
        .expect("First completion should apply");
    assert_eq!(backup.status, BackupStatus::Completed);
    let after_first = planner.schedule(schedule_id).await.unwrap();

    match planner.apply_completion(plan.backup_id, &full_done("cp-other"), now).await {
        Err(ChainError::StaleCompletionReport { backup_id, status }) => {
            assert_eq!(backup_id, plan.backup_id);
            assert_eq!(status, BackupStatus::Completed);
        }
        other => panic!("Expected StaleCompletionReport, got {:?}", other),
    }
    match planner.apply_failure(plan.backup_id, "late failure", now).await {
        Err(ChainError::StaleCompletionReport { .. }) => {}
        other => panic!("Expected StaleCompletionReport, got {:?}", other),
    }

    assert_eq!(planner.schedule(schedule_id).await.unwrap(), after_first);
}

#[tokio::test]
async fn test_failure_leaves_chain_untouched() {
    let (planner, _store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;
    let now = start();

    let full = planner.plan_next_backup(schedule_id, now).await.unwrap();
    planner.apply_completion(full.backup_id, &full_done("cp-0"), now).await.unwrap();
    let inc = planner.plan_next_backup(schedule_id, now + Duration::hours(1)).await.unwrap();
    planner
        .apply_completion(inc.backup_id, &incremental_done("cp-1"), now + Duration::hours(1))
        .await
        .unwrap();
    let before = planner.schedule(schedule_id).await.unwrap();

    let failing = planner.plan_next_backup(schedule_id, now + Duration::hours(2)).await.unwrap();
    assert_eq!(failing.backup_type, BackupType::Incremental);
    let failed = planner
        .apply_failure(failing.backup_id, "guest agent timeout", now + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(failed.status, BackupStatus::Failed);
    assert_eq!(failed.error_detail.as_deref(), Some("guest agent timeout"));

    let after = planner.schedule(schedule_id).await.unwrap();
    assert_eq!(after.last_full_backup_id, before.last_full_backup_id);
    assert_eq!(after.checkpoint_name, before.checkpoint_name);
    assert_eq!(after.incremental_count, before.incremental_count);
    assert_eq!(after.pending_backup_id, None);

    let retry = planner.plan_next_backup(schedule_id, now + Duration::hours(3)).await.unwrap();
    assert_eq!(retry.backup_type, BackupType::Incremental);
    assert_eq!(retry.checkpoint_baseline.as_deref(), Some("cp-1"));
}

#[tokio::test]
async fn test_failure_report_through_completion_entry_point() {
    let (planner, _store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;

    let plan = planner.plan_next_backup(schedule_id, start()).await.unwrap();
    let backup = planner
        .apply_completion(plan.backup_id, &CompletionReport::failure("disk full"), start())
        .await
        .unwrap();
    assert_eq!(backup.status, BackupStatus::Failed);
    assert!(!planner.schedule(schedule_id).await.unwrap().has_open_chain());
}

#[tokio::test]
async fn test_second_plan_while_in_flight_is_rejected() {
    let (planner, _store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;

    let plan = planner.plan_next_backup(schedule_id, start()).await.unwrap();
    match planner.plan_next_backup(schedule_id, start()).await {
        Err(ChainError::BackupInFlight { backup_id, .. }) => assert_eq!(backup_id, plan.backup_id),
        other => panic!("Expected BackupInFlight, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_plans_produce_one_backup() {
    let (planner, store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let planner = planner.clone();
        handles.push(tokio::spawn(async move { planner.plan_next_backup(schedule_id, start()).await }));
    }
    let mut planned = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            planned += 1;
        }
    }
    assert_eq!(planned, 1);
    assert_eq!(store.backups_for_schedule(schedule_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_incremental_without_changed_blocks_is_rejected() {
    let (planner, store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;
    let now = start();

    let full = planner.plan_next_backup(schedule_id, now).await.unwrap();
    planner.apply_completion(full.backup_id, &full_done("cp-0"), now).await.unwrap();
    let inc = planner.plan_next_backup(schedule_id, now + Duration::hours(1)).await.unwrap();

    let before = planner.schedule(schedule_id).await.unwrap();

    let report = CompletionReport::success().with_checkpoint("cp-1");
    match planner.apply_completion(inc.backup_id, &report, now + Duration::hours(1)).await {
        Err(ChainError::ChainInvariantViolation(detail)) => assert!(detail.contains("changed blocks")),
        other => panic!("Expected ChainInvariantViolation, got {:?}", other),
    }

    let rejected = planner.backup(inc.backup_id).await.unwrap();
    assert_eq!(rejected.status, BackupStatus::Failed);
    assert!(rejected.error_detail.unwrap().contains("changed blocks"));

    let after = planner.schedule(schedule_id).await.unwrap();
    assert_eq!(after.pending_backup_id, None);
    assert_eq!(after.last_full_backup_id, before.last_full_backup_id);
    assert_eq!(after.checkpoint_name, before.checkpoint_name);
    assert_eq!(after.incremental_count, before.incremental_count);

    let later = now + Duration::hours(2);
    let due = store.due_schedules(later).await.unwrap();
    assert!(due.iter().any(|s| s.id == schedule_id));

    let retry = planner.plan_next_backup(schedule_id, later).await.unwrap();
    assert_eq!(retry.backup_type, BackupType::Incremental);
    assert_eq!(retry.checkpoint_baseline.as_deref(), Some("cp-0"));
}

#[tokio::test]
async fn test_rejected_checkpoint_name_releases_schedule() {
    let (planner, _store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;

    let plan = planner.plan_next_backup(schedule_id, start()).await.unwrap();
    assert!(planner.apply_completion(plan.backup_id, &full_done("../escape"), start()).await.is_err());
    assert_eq!(planner.backup(plan.backup_id).await.unwrap().status, BackupStatus::Failed);

    let schedule = planner.schedule(schedule_id).await.unwrap();
    assert_eq!(schedule.pending_backup_id, None);
    assert!(!schedule.has_open_chain());

    // Terminal now, so a corrected report for the same backup is stale
    match planner.apply_completion(plan.backup_id, &full_done("cp-0"), start()).await {
        Err(ChainError::StaleCompletionReport { status, .. }) => assert_eq!(status, BackupStatus::Failed),
        other => panic!("Expected StaleCompletionReport, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bind_key_after_failure_is_rejected() {
    let (planner, _store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;
    let keys = KeyHierarchy::new(
        Arc::new(MemoryKeyStore::new()),
        MasterKey::generate(),
        KeyHierarchyConfig::default(),
    );
    let key = keys
        .create_key(&KeyTarget::Vm("vm-100".to_string()), KeyAlgorithm::Aes256Gcm)
        .await
        .unwrap();

    let plan = planner.plan_next_backup(schedule_id, start()).await.unwrap();
    planner.apply_failure(plan.backup_id, "host offline", start()).await.unwrap();

    match planner.bind_key(plan.backup_id, &key).await {
        Err(ChainError::ChainInvariantViolation(detail)) => assert!(detail.contains("Failed")),
        other => panic!("Expected ChainInvariantViolation, got {:?}", other),
    }
    let backup = planner.backup(plan.backup_id).await.unwrap();
    assert_eq!(backup.encryption_key_id, None);
    assert_eq!(backup.status, BackupStatus::Failed);
}

#[tokio::test]
async fn test_superseded_anchor_is_rejected() {
    let (planner, store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;
    let now = start();

    let full = planner.plan_next_backup(schedule_id, now).await.unwrap();
    planner.apply_completion(full.backup_id, &full_done("cp-0"), now).await.unwrap();
    let inc = planner.plan_next_backup(schedule_id, now + Duration::hours(1)).await.unwrap();

    let mut schedule = planner.schedule(schedule_id).await.unwrap();
    schedule.last_full_backup_id = Some(Uuid::new_v4());
    store.update_schedule(&schedule).await.unwrap();

    match planner.apply_completion(inc.backup_id, &incremental_done("cp-1"), now).await {
        Err(ChainError::ChainInvariantViolation(detail)) => assert!(detail.contains("superseded")),
        other => panic!("Expected ChainInvariantViolation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_checkpoint_name() {
    let (planner, _store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;

    let plan = planner.plan_next_backup(schedule_id, start()).await.unwrap();
    match planner.apply_completion(plan.backup_id, &full_done("../escape"), start()).await {
        Err(ChainError::InvalidCheckpointName(name)) => assert_eq!(name, "../escape"),
        other => panic!("Expected InvalidCheckpointName, got {:?}", other),
    }
}

#[tokio::test]
async fn test_restore_chain_and_verification() {
    let (planner, _store, schedule_id) =
        setup(vm_schedule(), ScriptedProbe::new(true), PlannerConfig::default()).await;
    let mut now = start();
    let mut ids = Vec::new();

    for tick in 0..3 {
        let plan = planner.plan_next_backup(schedule_id, now).await.unwrap();
        let report = if tick == 0 {
            full_done("cp-0")
        } else {
            incremental_done(&format!("cp-{}", tick))
        };
        planner.apply_completion(plan.backup_id, &report, now).await.unwrap();
        ids.push(plan.backup_id);
        now += Duration::hours(1);
    }

    let chain = planner.restore_chain(ids[2]).await.expect("Failed to build restore chain");
    assert_eq!(chain.iter().map(|b| b.id).collect::<Vec<_>>(), ids);

    let verified = planner
        .apply_verification(
            ids[0],
            &VerificationReport {
                verified: true,
                status: VerificationStatus::Passed,
                job_id: Some(Uuid::new_v4()),
                table_count: Some(12),
                size_bytes: Some(4096),
                duration_seconds: Some(3.5),
                error: None,
            },
        )
        .await
        .unwrap();
    assert!(verified.verification.verified);
    assert_eq!(verified.verification.status, VerificationStatus::Passed);
}

#[tokio::test]
async fn test_schedule_requires_known_backend() {
    let store = Arc::new(MemoryBackupStore::new());
    let planner = ChainPlanner::new(store, ScriptedProbe::new(true), PlannerConfig::default());

    match planner.register_schedule(vm_schedule()).await {
        Err(ChainError::StorageBackendNotFound(id)) => assert_eq!(id, "nas"),
        other => panic!("Expected StorageBackendNotFound, got {:?}", other),
    }
}
