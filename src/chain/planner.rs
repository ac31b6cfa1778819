//! Backup chain planner
//!
//! Each schedule moves between two states. With no open chain the next
//! backup is FULL; once a full backup completes with a checkpoint, the chain
//! is open and incrementals are planned against that checkpoint until the
//! chain is closed by policy, chain length, the weekly full day, or a loss of
//! change-tracking capability.
//!
//! Every mutation of a schedule's chain state happens under a per-schedule
//! lock and is written back with an optimistic row-version check, so two
//! overlapping ticks can never both plan or both advance a checkpoint.

use super::store::BackupStore;
use super::types::{
    Backup, BackupModePolicy, BackupSchedule, BackupStatus, BackupType, Capability, CbtMetadata,
    CompletionReport, ConsistencyMetadata, Plan, PlanReason, StorageBackend, VerificationMetadata,
    VerificationReport,
};
use super::ChainError;
use crate::config::PlannerConfig;
use crate::keys::{EncryptionKey, EncryptionScheme};
use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use dashmap::DashMap;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

lazy_static! {
    static ref CHECKPOINT_NAME: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap();
}

/// Transient failure of the capability probe. Never means "incapable".
#[derive(Error, Debug, Clone)]
#[error("Capability probe failed: {0}")]
pub struct ProbeError(pub String);

/// Asks the hypervisor side whether a workload supports changed-block tracking.
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    /// `Ok(false)` only when the workload definitely cannot take incrementals.
    async fn probe_incremental_capability(&self, schedule: &BackupSchedule) -> Result<bool, ProbeError>;
}

/// Outcome of the pure planning decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Full or incremental.
    pub backup_type: BackupType,
    /// Which rule decided.
    pub reason: PlanReason,
}

impl Decision {
    fn full(reason: PlanReason) -> Self {
        Self {
            backup_type: BackupType::Full,
            reason,
        }
    }
}

/// Decide full vs. incremental from the schedule's (already refreshed) state.
///
/// `previous_capability` is what was cached before this tick's probe, used to
/// detect a capable-to-incapable flip in the middle of a chain.
/// `anchor_taken_today` is true when the chain's full backup was captured on
/// the same (UTC) day as `today`; the weekly full day then counts as done.
pub fn decide(
    schedule: &BackupSchedule,
    previous_capability: Capability,
    today: Weekday,
    anchor_taken_today: bool,
) -> Decision {
    if schedule.backup_mode_policy == BackupModePolicy::FullOnly {
        return Decision::full(PlanReason::FullOnlyPolicy);
    }
    if !schedule.has_open_chain() {
        return Decision::full(PlanReason::NoChain);
    }
    match schedule.capability {
        Capability::Unknown => return Decision::full(PlanReason::CapabilityUnknown),
        Capability::Incapable if previous_capability == Capability::Capable => {
            return Decision::full(PlanReason::CapabilityLost)
        }
        Capability::Incapable => return Decision::full(PlanReason::Incapable),
        Capability::Capable => {}
    }
    // Weekly full day wins over chain length.
    if schedule.full_backup_day == Some(today) && !anchor_taken_today {
        return Decision::full(PlanReason::FullBackupDay);
    }
    if schedule.incremental_count >= schedule.max_chain_length {
        return Decision::full(PlanReason::ChainLengthReached);
    }
    Decision {
        backup_type: BackupType::Incremental,
        reason: PlanReason::ContinueChain,
    }
}

/// Decides each schedule's next backup and applies outcomes to its chain.
///
/// Every chain-state write for a schedule happens under that schedule's
/// lock and goes through [`BackupStore::commit_plan`] or
/// [`BackupStore::commit_outcome`].
#[derive(Clone)]
pub struct ChainPlanner {
    store: Arc<dyn BackupStore>,
    probe: Arc<dyn CapabilityProbe>,
    config: PlannerConfig,
    schedule_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ChainPlanner {
    /// Build a planner over `store`, asking `probe` about incremental support.
    pub fn new(
        store: Arc<dyn BackupStore>,
        probe: Arc<dyn CapabilityProbe>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            store,
            probe,
            config,
            schedule_locks: Arc::new(DashMap::new()),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn BackupStore> {
        &self.store
    }

    fn schedule_lock(&self, schedule_id: Uuid) -> Arc<Mutex<()>> {
        self.schedule_locks
            .entry(schedule_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create or replace a storage backend.
    pub async fn register_storage_backend(&self, backend: &StorageBackend) -> Result<(), ChainError> {
        self.store.upsert_storage_backend(backend).await
    }

    /// Persist a new schedule. Chain state always starts empty.
    pub async fn register_schedule(&self, schedule: BackupSchedule) -> Result<BackupSchedule, ChainError> {
        if self
            .store
            .get_storage_backend(&schedule.storage_backend_id)
            .await?
            .is_none()
        {
            return Err(ChainError::StorageBackendNotFound(schedule.storage_backend_id));
        }

        let schedule = BackupSchedule {
            last_full_backup_id: None,
            checkpoint_name: None,
            incremental_count: 0,
            pending_backup_id: None,
            capability: Capability::Unknown,
            capability_checked_at: None,
            row_version: 0,
            ..schedule
        };
        self.store.insert_schedule(&schedule).await?;
        info!(schedule_id = %schedule.id, workload = %schedule.workload, "Registered backup schedule");
        Ok(schedule)
    }

    /// Load a schedule or fail with `ScheduleNotFound`.
    pub async fn schedule(&self, schedule_id: Uuid) -> Result<BackupSchedule, ChainError> {
        self.store
            .get_schedule(schedule_id)
            .await?
            .ok_or(ChainError::ScheduleNotFound(schedule_id))
    }

    /// Load a backup or fail with `BackupNotFound`.
    pub async fn backup(&self, backup_id: Uuid) -> Result<Backup, ChainError> {
        self.store
            .get_backup(backup_id)
            .await?
            .ok_or(ChainError::BackupNotFound(backup_id))
    }

    fn capability_is_stale(&self, schedule: &BackupSchedule, now: DateTime<Utc>) -> bool {
        if schedule.capability == Capability::Unknown {
            return true;
        }
        match schedule.capability_checked_at {
            None => true,
            Some(checked) => now - checked > self.config.capability_staleness,
        }
    }

    async fn probe_capability(&self, schedule: &BackupSchedule) -> Result<bool, ChainError> {
        self.probe
            .probe_incremental_capability(schedule)
            .await
            .map_err(|e| ChainError::CapabilityUnknown(e.0))
    }

    async fn refresh_capability(&self, schedule: &mut BackupSchedule, now: DateTime<Utc>) {
        if schedule.backup_mode_policy == BackupModePolicy::FullOnly
            || !self.capability_is_stale(schedule, now)
        {
            return;
        }

        schedule.capability = match self.probe_capability(schedule).await {
            Ok(true) => Capability::Capable,
            Ok(false) => Capability::Incapable,
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Capability unknown, forcing full backup");
                metrics::record_error("capability_unknown", "planner");
                Capability::Unknown
            }
        };
        schedule.capability_checked_at = Some(now);
        debug!(schedule_id = %schedule.id, capability = ?schedule.capability, "Refreshed incremental capability");
    }

    /// Whether the schedule's current anchor was captured on `now`'s day.
    async fn anchor_taken_on(&self, schedule: &BackupSchedule, now: DateTime<Utc>) -> Result<bool, ChainError> {
        let Some(anchor_id) = schedule.last_full_backup_id else {
            return Ok(false);
        };
        if schedule.full_backup_day.is_none() {
            return Ok(false);
        }
        Ok(self
            .store
            .get_backup(anchor_id)
            .await?
            .map_or(false, |anchor| anchor.created_at.date_naive() == now.date_naive()))
    }

    /// Check that `anchor_id` is a completed full backup that still anchors
    /// the schedule's chain.
    async fn validate_anchor(
        &self,
        schedule: &BackupSchedule,
        anchor_id: Option<Uuid>,
    ) -> Result<Backup, ChainError> {
        let violation = |detail: String| {
            error!(schedule_id = %schedule.id, detail = %detail, "Chain invariant violation");
            metrics::record_error("chain_invariant_violation", "planner");
            ChainError::ChainInvariantViolation(detail)
        };

        let Some(anchor_id) = anchor_id else {
            return Err(violation("incremental backup has no anchor".to_string()));
        };
        if schedule.last_full_backup_id != Some(anchor_id) {
            return Err(violation(format!(
                "anchor {} has been superseded by {:?}",
                anchor_id, schedule.last_full_backup_id
            )));
        }
        let anchor = match self.store.get_backup(anchor_id).await? {
            Some(anchor) => anchor,
            None => return Err(violation(format!("anchor backup {} does not exist", anchor_id))),
        };
        if anchor.backup_type != BackupType::Full {
            return Err(violation(format!("anchor backup {} is not a full backup", anchor_id)));
        }
        if anchor.status != BackupStatus::Completed {
            return Err(violation(format!("anchor backup {} has not completed", anchor_id)));
        }
        Ok(anchor)
    }

    /// Decide and record the next backup for a schedule.
    #[instrument(skip(self, now))]
    pub async fn plan_next_backup(&self, schedule_id: Uuid, now: DateTime<Utc>) -> Result<Plan, ChainError> {
        let lock = self.schedule_lock(schedule_id);
        let _guard = lock.lock().await;

        let mut schedule = self.schedule(schedule_id).await?;
        if let Some(pending) = schedule.pending_backup_id {
            return Err(ChainError::BackupInFlight {
                schedule_id,
                backup_id: pending,
            });
        }

        let previous_capability = schedule.capability;
        self.refresh_capability(&mut schedule, now).await;
        let anchor_taken_today = self.anchor_taken_on(&schedule, now).await?;
        let decision = decide(&schedule, previous_capability, now.weekday(), anchor_taken_today);

        let backend = self
            .store
            .get_storage_backend(&schedule.storage_backend_id)
            .await?
            .ok_or_else(|| ChainError::StorageBackendNotFound(schedule.storage_backend_id.clone()))?;

        let (anchor_backup_id, checkpoint_baseline) = match decision.backup_type {
            BackupType::Incremental => {
                let anchor = self.validate_anchor(&schedule, schedule.last_full_backup_id).await?;
                (Some(anchor.id), schedule.checkpoint_name.clone())
            }
            BackupType::Full => (None, None),
        };

        let backup = Backup {
            id: Uuid::new_v4(),
            schedule_id,
            workload: schedule.workload.clone(),
            backup_type: decision.backup_type,
            status: BackupStatus::Planned,
            created_at: now,
            completed_at: None,
            anchor_backup_id,
            encryption_key_id: None,
            encryption_scheme: None,
            cbt: CbtMetadata {
                cbt_enabled: decision.backup_type == BackupType::Incremental,
                bitmap_name: checkpoint_baseline.clone(),
                block_size: None,
                changed_blocks_count: None,
            },
            consistency: ConsistencyMetadata::default(),
            verification: VerificationMetadata::default(),
            error_detail: None,
        };

        if decision.backup_type == BackupType::Full {
            // A starting full backup ends the open chain's checkpoint lineage.
            schedule.checkpoint_name = None;
            if decision.reason == PlanReason::CapabilityLost
                || (schedule.backup_mode_policy == BackupModePolicy::IncrementalPreferred
                    && matches!(decision.reason, PlanReason::Incapable | PlanReason::CapabilityUnknown))
            {
                warn!(
                    schedule_id = %schedule_id,
                    reason = decision.reason.as_str(),
                    "Incremental backups unavailable, planning full backup"
                );
            }
        }
        schedule.pending_backup_id = Some(backup.id);
        schedule.next_run_at = Some(now + Duration::minutes(i64::from(schedule.interval_minutes)));

        self.store.commit_plan(&schedule, &backup).await?;

        metrics::record_plan(decision.backup_type, decision.reason);
        info!(
            schedule_id = %schedule_id,
            backup_id = %backup.id,
            backup_type = decision.backup_type.as_str(),
            reason = decision.reason.as_str(),
            anchor = ?anchor_backup_id,
            "Planned backup"
        );

        Ok(Plan {
            backup_id: backup.id,
            schedule_id,
            workload: schedule.workload.clone(),
            backup_type: decision.backup_type,
            reason: decision.reason,
            anchor_backup_id,
            checkpoint_baseline,
            key_target: backend.key_target(&schedule.workload),
            allow_key_fallback: backend.allow_global_fallback,
            key: None,
            planned_at: now,
        })
    }

    /// Record which key a planned backup is encrypted with.
    pub async fn bind_key(&self, backup_id: Uuid, key: &EncryptionKey) -> Result<Backup, ChainError> {
        let schedule_id = self.backup(backup_id).await?.schedule_id;
        let lock = self.schedule_lock(schedule_id);
        let _guard = lock.lock().await;

        let mut backup = self.backup(backup_id).await?;
        if backup.status.is_terminal() {
            return Err(ChainError::ChainInvariantViolation(format!(
                "cannot bind a key to backup {} after it is {:?}",
                backup_id, backup.status
            )));
        }
        backup.encryption_key_id = Some(key.id);
        backup.encryption_scheme = Some(EncryptionScheme::from(key.scope()));
        self.store.update_backup(&backup).await?;
        Ok(backup)
    }

    /// Apply the execution collaborator's completion report. A second
    /// delivery for the same backup yields `StaleCompletionReport` and changes
    /// nothing. A report that breaks a chain invariant is surfaced as an
    /// error and the backup is marked failed, leaving the chain as it was.
    #[instrument(skip(self, report, now), fields(success = report.success))]
    pub async fn apply_completion(
        &self,
        backup_id: Uuid,
        report: &CompletionReport,
        now: DateTime<Utc>,
    ) -> Result<Backup, ChainError> {
        if !report.success {
            let detail = report
                .error_detail
                .clone()
                .unwrap_or_else(|| "backup reported failure".to_string());
            return self.apply_failure(backup_id, &detail, now).await;
        }

        let schedule_id = self.backup(backup_id).await?.schedule_id;
        let lock = self.schedule_lock(schedule_id);
        let _guard = lock.lock().await;

        let backup = self.backup(backup_id).await?;
        if backup.status.is_terminal() {
            return Err(ChainError::StaleCompletionReport {
                backup_id,
                status: backup.status,
            });
        }
        let schedule = self.schedule(schedule_id).await?;

        let mut completed = backup.clone();
        let mut advanced = schedule.clone();
        if let Err(e) = self.advance_chain(&mut advanced, &mut completed, report).await {
            self.record_failure(schedule, backup, &format!("rejected completion report: {}", e), now)
                .await?;
            return Err(e);
        }

        completed.status = BackupStatus::Completed;
        completed.completed_at = Some(now);
        completed.consistency = ConsistencyMetadata {
            application_consistent: report.application_consistent,
            freeze_status: report.freeze_status,
        };
        advanced.pending_backup_id = None;

        let schedule = self.store.commit_outcome(&advanced, &completed).await?;

        metrics::record_outcome(completed.backup_type, "completed");
        info!(
            backup_id = %backup_id,
            schedule_id = %schedule_id,
            backup_type = completed.backup_type.as_str(),
            chain_length = schedule.incremental_count,
            checkpoint = ?schedule.checkpoint_name,
            "Applied backup completion"
        );
        Ok(completed)
    }

    /// Validate a successful report and move the chain forward on the
    /// given copies.
    async fn advance_chain(
        &self,
        schedule: &mut BackupSchedule,
        backup: &mut Backup,
        report: &CompletionReport,
    ) -> Result<(), ChainError> {
        if schedule.pending_backup_id != Some(backup.id) {
            error!(backup_id = %backup.id, schedule_id = %schedule.id, "Completion for a backup the schedule is not waiting on");
            metrics::record_error("chain_invariant_violation", "planner");
            return Err(ChainError::ChainInvariantViolation(format!(
                "schedule {} is not waiting on backup {}",
                schedule.id, backup.id
            )));
        }
        if let Some(name) = &report.new_checkpoint_name {
            if !CHECKPOINT_NAME.is_match(name) {
                metrics::record_error("invalid_checkpoint_name", "planner");
                return Err(ChainError::InvalidCheckpointName(name.clone()));
            }
        }

        match backup.backup_type {
            BackupType::Full => {
                backup.cbt = CbtMetadata {
                    cbt_enabled: report.new_checkpoint_name.is_some(),
                    bitmap_name: report.new_checkpoint_name.clone(),
                    block_size: report.block_size,
                    changed_blocks_count: None,
                };
                schedule.last_full_backup_id = Some(backup.id);
                schedule.checkpoint_name = report.new_checkpoint_name.clone();
                schedule.incremental_count = 0;
            }
            BackupType::Incremental => {
                self.validate_anchor(schedule, backup.anchor_backup_id).await?;
                let changed = match report.changed_blocks_count {
                    Some(count) if count > 0 => count,
                    _ => {
                        metrics::record_error("chain_invariant_violation", "planner");
                        return Err(ChainError::ChainInvariantViolation(format!(
                            "incremental backup {} reported no changed blocks",
                            backup.id
                        )));
                    }
                };
                let Some(checkpoint) = report.new_checkpoint_name.clone() else {
                    metrics::record_error("chain_invariant_violation", "planner");
                    return Err(ChainError::ChainInvariantViolation(format!(
                        "incremental backup {} did not report a new checkpoint",
                        backup.id
                    )));
                };
                backup.cbt.changed_blocks_count = Some(changed);
                backup.cbt.block_size = report.block_size;
                schedule.checkpoint_name = Some(checkpoint);
                schedule.incremental_count += 1;
            }
        }
        Ok(())
    }

    /// Mark a backup failed. Anchor, checkpoint and chain counter stay as
    /// they were so the next tick makes the same decision again.
    #[instrument(skip(self, now))]
    pub async fn apply_failure(
        &self,
        backup_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Backup, ChainError> {
        let schedule_id = self.backup(backup_id).await?.schedule_id;
        let lock = self.schedule_lock(schedule_id);
        let _guard = lock.lock().await;

        let backup = self.backup(backup_id).await?;
        if backup.status.is_terminal() {
            return Err(ChainError::StaleCompletionReport {
                backup_id,
                status: backup.status,
            });
        }
        let schedule = self.schedule(schedule_id).await?;
        self.record_failure(schedule, backup, reason, now).await
    }

    /// Caller holds the schedule lock.
    async fn record_failure(
        &self,
        mut schedule: BackupSchedule,
        mut backup: Backup,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Backup, ChainError> {
        backup.status = BackupStatus::Failed;
        backup.completed_at = Some(now);
        backup.error_detail = Some(reason.to_string());
        if schedule.pending_backup_id == Some(backup.id) {
            schedule.pending_backup_id = None;
        }

        self.store.commit_outcome(&schedule, &backup).await?;

        metrics::record_outcome(backup.backup_type, "failed");
        warn!(
            backup_id = %backup.id,
            schedule_id = %schedule.id,
            backup_type = backup.backup_type.as_str(),
            reason = %reason,
            "Backup failed"
        );
        Ok(backup)
    }

    /// Store the verification collaborator's findings on a completed backup.
    pub async fn apply_verification(
        &self,
        backup_id: Uuid,
        report: &VerificationReport,
    ) -> Result<Backup, ChainError> {
        let mut backup = self.backup(backup_id).await?;
        if backup.status != BackupStatus::Completed {
            return Err(ChainError::ChainInvariantViolation(format!(
                "backup {} cannot be verified while {:?}",
                backup_id, backup.status
            )));
        }
        backup.verification = VerificationMetadata {
            verified: report.verified,
            status: report.status,
            job_id: report.job_id,
            table_count: report.table_count,
            size_bytes: report.size_bytes,
            duration_seconds: report.duration_seconds,
            error: report.error.clone(),
        };
        self.store.update_backup(&backup).await?;
        info!(backup_id = %backup_id, status = ?report.status, "Recorded backup verification");
        Ok(backup)
    }

    /// Backups needed to restore `backup_id`: its anchor followed by every
    /// completed incremental of that chain up to and including it.
    pub async fn restore_chain(&self, backup_id: Uuid) -> Result<Vec<Backup>, ChainError> {
        let target = self.backup(backup_id).await?;
        if target.status != BackupStatus::Completed {
            return Err(ChainError::ChainInvariantViolation(format!(
                "backup {} has not completed",
                backup_id
            )));
        }
        let anchor_id = match target.backup_type {
            BackupType::Full => return Ok(vec![target]),
            BackupType::Incremental => target.anchor_backup_id.ok_or_else(|| {
                ChainError::ChainInvariantViolation(format!("incremental {} has no anchor", backup_id))
            })?,
        };
        let anchor = self.store.get_backup(anchor_id).await?.ok_or_else(|| {
            ChainError::ChainInvariantViolation(format!("anchor {} of {} is missing", anchor_id, backup_id))
        })?;

        let mut chain = vec![anchor];
        chain.extend(
            self.store
                .backups_for_schedule(target.schedule_id)
                .await?
                .into_iter()
                .filter(|b| {
                    b.backup_type == BackupType::Incremental
                        && b.status == BackupStatus::Completed
                        && b.anchor_backup_id == Some(anchor_id)
                        && b.created_at <= target.created_at
                }),
        );
        Ok(chain)
    }
}
