// Backup Orchestrator - composes planner, key hierarchy and compliance per tick

use super::collaborators::{Clock, ExecutionCollaborator, ExecutionRequest};
use crate::chain::{
    Backup, BackupSchedule, BackupStatus, BackupStore, CapabilityProbe, ChainError, ChainPlanner,
    CompletionReport, Plan, StorageBackend, VerificationReport, WorkloadRef,
};
use crate::compliance::{ComplianceEvaluator, ComplianceMonitor, ComplianceRecord, PolicyDirectory};
use crate::config::CoreConfig;
use crate::keys::{
    EncryptionKey, ImportSummary, KeyError, KeyExport, KeyHandle, KeyHierarchy, KeyReferences,
    KeyStore, KeyTarget, MasterKey,
};
use crate::{metrics, CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Result of feeding an outcome back into the core.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The outcome was applied; carries the updated backup.
    Applied(Backup),
    /// Duplicate delivery for a backup that already reached `status`.
    Ignored {
        /// Backup the report was for.
        backup_id: Uuid,
        /// Status it already had.
        status: BackupStatus,
    },
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickSummary {
    /// Plans made and dispatched.
    pub planned: Vec<Plan>,
    /// Schedules skipped because a backup is still in flight.
    pub skipped: Vec<Uuid>,
    /// Schedules that failed to plan or dispatch, with the error.
    pub failed: Vec<(Uuid, String)>,
}

/// Counts backup rows pointing at a key, for referential integrity on delete.
struct StoreKeyReferences<'a>(&'a dyn BackupStore);

#[async_trait]
impl KeyReferences for StoreKeyReferences<'_> {
    async fn count_key_references(&self, key_id: Uuid) -> std::result::Result<usize, KeyError> {
        self.0
            .count_key_references(key_id)
            .await
            .map_err(|e| KeyError::Storage(e.to_string()))
    }
}

/// Entry point composing the chain planner, key hierarchy and compliance
/// monitor. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct BackupOrchestrator {
    planner: ChainPlanner,
    keys: KeyHierarchy,
    compliance: ComplianceMonitor,
    executor: Arc<dyn ExecutionCollaborator>,
    clock: Arc<dyn Clock>,
    tick_permits: Arc<Semaphore>,
}

impl BackupOrchestrator {
    /// Compose already-built components.
    pub fn new(
        planner: ChainPlanner,
        keys: KeyHierarchy,
        compliance: ComplianceMonitor,
        executor: Arc<dyn ExecutionCollaborator>,
        clock: Arc<dyn Clock>,
        max_concurrent_ticks: usize,
    ) -> Self {
        Self {
            planner,
            keys,
            compliance,
            executor,
            clock,
            tick_permits: Arc::new(Semaphore::new(max_concurrent_ticks.max(1))),
        }
    }

    /// Wire every component from configuration and the supplied collaborators.
    pub fn from_config(
        config: &CoreConfig,
        key_store: Arc<dyn KeyStore>,
        backup_store: Arc<dyn BackupStore>,
        probe: Arc<dyn CapabilityProbe>,
        policies: Arc<dyn PolicyDirectory>,
        executor: Arc<dyn ExecutionCollaborator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let master_key = config.master_key.load()?;
        info!(master_key_id = %master_key.id(), "Loaded master key");

        let keys = KeyHierarchy::new(key_store, master_key, config.keys.clone());
        for source in &config.retired_master_keys {
            keys.register_retired_master_key(source.load()?);
        }
        let planner = ChainPlanner::new(backup_store.clone(), probe, config.planner.clone());
        let compliance = ComplianceMonitor::new(
            ComplianceEvaluator::new(config.compliance.clone()),
            policies,
            backup_store,
        );
        Ok(Self::new(
            planner,
            keys,
            compliance,
            executor,
            clock,
            config.max_concurrent_ticks,
        ))
    }

    /// The chain planner.
    pub fn planner(&self) -> &ChainPlanner {
        &self.planner
    }

    /// The key hierarchy.
    pub fn keys(&self) -> &KeyHierarchy {
        &self.keys
    }

    /// Create or replace a storage backend.
    pub async fn register_storage_backend(&self, backend: &StorageBackend) -> Result<()> {
        Ok(self.planner.register_storage_backend(backend).await?)
    }

    /// Register a schedule on a known backend.
    pub async fn register_schedule(&self, schedule: BackupSchedule) -> Result<BackupSchedule> {
        Ok(self.planner.register_schedule(schedule).await?)
    }

    /// Plan and dispatch every due schedule, one task per schedule.
    #[instrument(skip(self))]
    pub async fn run_tick(&self) -> Result<TickSummary> {
        let now = self.clock.now();
        let due = self.planner.store().due_schedules(now).await?;
        debug!(due = due.len(), "Starting scheduling tick");

        let mut handles = Vec::with_capacity(due.len());
        for schedule in due {
            let permit = self
                .tick_permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = match this.plan_next_backup(schedule.id).await {
                    Ok(plan) => this.dispatch(&plan).await.map(|_| plan),
                    Err(e) => Err(e),
                };
                (schedule.id, outcome)
            }));
        }

        let mut summary = TickSummary::default();
        for joined in join_all(handles).await {
            let (schedule_id, outcome) = joined?;
            match outcome {
                Ok(plan) => summary.planned.push(plan),
                Err(CoreError::Chain(ChainError::BackupInFlight { .. })) => {
                    summary.skipped.push(schedule_id)
                }
                Err(e) => {
                    warn!(schedule_id = %schedule_id, error = %e, "Scheduling tick failed for schedule");
                    metrics::record_error(e.kind().as_str(), "orchestrator");
                    summary.failed.push((schedule_id, e.to_string()));
                }
            }
        }

        info!(
            planned = summary.planned.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Scheduling tick finished"
        );
        Ok(summary)
    }

    /// Plan the next backup and bind its encryption key.
    #[instrument(skip(self))]
    pub async fn plan_next_backup(&self, schedule_id: Uuid) -> Result<Plan> {
        let now = self.clock.now();
        let mut plan = self.planner.plan_next_backup(schedule_id, now).await?;

        if let Some(target) = plan.key_target.clone() {
            match self.keys.resolve_or_create(&target, plan.allow_key_fallback).await {
                Ok(key) => {
                    self.planner.bind_key(plan.backup_id, &key).await?;
                    plan.key = Some(key.handle());
                }
                Err(e) => {
                    self.planner
                        .apply_failure(plan.backup_id, &format!("key resolution failed: {}", e), now)
                        .await?;
                    return Err(e.into());
                }
            }
        }
        Ok(plan)
    }

    /// Hand a plan to the execution collaborator. A rejected submission
    /// fails the backup so the schedule is not left waiting.
    pub async fn dispatch(&self, plan: &Plan) -> Result<()> {
        let request = ExecutionRequest::from(plan);
        match self.executor.submit(request).await {
            Ok(()) => {
                debug!(backup_id = %plan.backup_id, "Dispatched backup");
                Ok(())
            }
            Err(e) => {
                warn!(backup_id = %plan.backup_id, error = %e, "Execution collaborator rejected backup");
                self.apply_failure(plan.backup_id, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    /// Apply a completion report. Duplicates are ignored, not errors.
    #[instrument(skip(self, report))]
    pub async fn apply_completion(&self, backup_id: Uuid, report: &CompletionReport) -> Result<ApplyOutcome> {
        let now = self.clock.now();
        let applied = self.planner.apply_completion(backup_id, report, now).await;
        self.settle(applied, now).await
    }

    /// Fail a backup with `reason`.
    #[instrument(skip(self))]
    pub async fn apply_failure(&self, backup_id: Uuid, reason: &str) -> Result<ApplyOutcome> {
        let now = self.clock.now();
        let applied = self.planner.apply_failure(backup_id, reason, now).await;
        self.settle(applied, now).await
    }

    /// Record restore-test findings on a backup.
    pub async fn apply_verification(&self, backup_id: Uuid, report: &VerificationReport) -> Result<Backup> {
        Ok(self.planner.apply_verification(backup_id, report).await?)
    }

    async fn settle(
        &self,
        applied: std::result::Result<Backup, ChainError>,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome> {
        match applied {
            Ok(backup) => {
                self.refresh_compliance(&backup.workload, now).await;
                Ok(ApplyOutcome::Applied(backup))
            }
            Err(ChainError::StaleCompletionReport { backup_id, status }) => {
                info!(backup_id = %backup_id, status = ?status, "Ignoring duplicate backup report");
                Ok(ApplyOutcome::Ignored { backup_id, status })
            }
            Err(e) => {
                metrics::record_error("apply_outcome", "orchestrator");
                Err(e.into())
            }
        }
    }

    async fn refresh_compliance(&self, workload: &WorkloadRef, now: DateTime<Utc>) {
        if let Err(e) = self.compliance.refresh(workload, now).await {
            warn!(workload = %workload, error = %e, "Compliance refresh failed");
        }
    }

    /// Recompute compliance for one workload now.
    pub async fn get_compliance_status(&self, workload: &WorkloadRef) -> Result<ComplianceRecord> {
        Ok(self.compliance.refresh(workload, self.clock.now()).await?)
    }

    /// Recompute compliance for every known workload.
    pub async fn refresh_all_compliance(&self) -> Result<Vec<ComplianceRecord>> {
        Ok(self.compliance.refresh_all(self.clock.now()).await?)
    }

    /// Last computed record without recomputing.
    pub fn cached_compliance(&self, workload: &WorkloadRef) -> Option<ComplianceRecord> {
        self.compliance.cached(workload)
    }

    /// Issue the next key version for `target`.
    pub async fn rotate_key(&self, target: &KeyTarget) -> Result<EncryptionKey> {
        Ok(self.keys.rotate_key(target).await?)
    }

    /// Returns the id of the master key that was replaced.
    pub async fn rotate_master_key(&self, next: MasterKey) -> String {
        self.keys.rotate_master_key(next).await
    }

    /// Raw DEK for a handle. Keep the buffer short-lived.
    pub async fn unwrap_key(&self, handle: &KeyHandle) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.keys.unwrap_handle(handle).await?)
    }

    /// Delete a retired key that no backup references.
    pub async fn delete_key(&self, key_id: Uuid) -> Result<()> {
        let references = StoreKeyReferences(self.planner.store().as_ref());
        Ok(self.keys.delete_key(key_id, &references).await?)
    }

    /// Export every wrapped key.
    pub async fn export_keys(&self) -> Result<KeyExport> {
        Ok(self.keys.export_keys().await?)
    }

    /// Import an export, skipping known ids and reporting conflicts.
    pub async fn import_keys(&self, export: &KeyExport) -> Result<ImportSummary> {
        Ok(self.keys.import_keys(export).await?)
    }

    /// Backups needed to restore `backup_id`, anchor first.
    pub async fn restore_chain(&self, backup_id: Uuid) -> Result<Vec<Backup>> {
        Ok(self.planner.restore_chain(backup_id).await?)
    }
}
