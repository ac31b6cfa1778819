// Backup chain types - schedules, backups and the plans that link them

use crate::keys::{EncryptionScheme, EncryptionStrategy, KeyHandle, KeyTarget};
use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The protected workload a schedule or backup belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum WorkloadRef {
    /// A virtual machine, by hypervisor id.
    Vm(String),
    /// A container, by runtime id.
    Container(String),
}

impl WorkloadRef {
    /// Identifier without the workload kind.
    pub fn id(&self) -> &str {
        match self {
            WorkloadRef::Vm(id) | WorkloadRef::Container(id) => id,
        }
    }

    /// Key target used when a backend encrypts per workload.
    pub fn key_target(&self) -> KeyTarget {
        match self {
            WorkloadRef::Vm(id) => KeyTarget::Vm(id.clone()),
            WorkloadRef::Container(id) => KeyTarget::Container(id.clone()),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadRef::Vm(id) => write!(f, "vm/{}", id),
            WorkloadRef::Container(id) => write!(f, "container/{}", id),
        }
    }
}

/// Kind of backup a plan produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    /// Self-contained image; starts a new chain.
    Full,
    /// Changed blocks since the chain's last checkpoint.
    Incremental,
}

impl BackupType {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }
}

/// Lifecycle of a backup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Recorded by the planner, waiting for an outcome.
    Planned,
    /// Execution reported success.
    Completed,
    /// Execution failed or the report was rejected.
    Failed,
}

impl BackupStatus {
    /// Completed and failed backups accept no further outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::Planned)
    }
}

/// Operator preference between full and incremental backups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupModePolicy {
    /// Incremental when the workload supports it.
    Auto,
    /// Always take full backups.
    FullOnly,
    /// Like `Auto`, but a forced full is logged as a warning.
    IncrementalPreferred,
}

/// Cached answer of the capability probe. `Unknown` is never `Incapable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Never probed, or the last probe failed.
    Unknown,
    /// Changed block tracking is available.
    Capable,
    /// The workload cannot produce incrementals.
    Incapable,
}

/// Outcome of the guest filesystem freeze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezeStatus {
    /// No freeze was requested.
    NotAttempted,
    /// Filesystems were frozen for the snapshot.
    Frozen,
    /// The guest agent could not freeze.
    Failed,
    /// No guest agent to freeze with.
    Unsupported,
}

/// Result of a restore test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// No restore test has run.
    NotVerified,
    /// The restored image checked out.
    Passed,
    /// The restore test found a problem.
    Failed,
}

/// Changed block tracking details of a backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CbtMetadata {
    /// Whether the backup used or produced a CBT checkpoint.
    pub cbt_enabled: bool,
    /// Checkpoint / bitmap the changed blocks were computed against.
    pub bitmap_name: Option<String>,
    /// Block size in bytes.
    pub block_size: Option<u64>,
    /// Blocks copied by an incremental.
    pub changed_blocks_count: Option<u64>,
}

/// How consistent the captured image is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyMetadata {
    /// Applications were quiesced before capture.
    pub application_consistent: bool,
    /// Guest freeze outcome.
    pub freeze_status: FreezeStatus,
}

impl Default for ConsistencyMetadata {
    fn default() -> Self {
        Self {
            application_consistent: false,
            freeze_status: FreezeStatus::NotAttempted,
        }
    }
}

/// Restore-test findings recorded on a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationMetadata {
    /// Whether a restore test has run.
    pub verified: bool,
    /// Verdict of the restore test.
    pub status: VerificationStatus,
    /// Verification job that produced the findings.
    pub job_id: Option<Uuid>,
    /// Database tables found in the restored image.
    pub table_count: Option<u64>,
    /// Size of the restored image.
    pub size_bytes: Option<u64>,
    /// How long the restore test took.
    pub duration_seconds: Option<f64>,
    /// Failure detail from the verifier.
    pub error: Option<String>,
}

impl Default for VerificationMetadata {
    fn default() -> Self {
        Self {
            verified: false,
            status: VerificationStatus::NotVerified,
            job_id: None,
            table_count: None,
            size_bytes: None,
            duration_seconds: None,
            error: None,
        }
    }
}

/// One backup of one workload. Never mutated once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Unique id.
    pub id: Uuid,
    /// Schedule that planned this backup.
    pub schedule_id: Uuid,
    /// Workload being protected.
    pub workload: WorkloadRef,
    /// Full or incremental.
    pub backup_type: BackupType,
    /// Current lifecycle state.
    pub status: BackupStatus,
    /// Point in time the backup captures.
    pub created_at: DateTime<Utc>,
    /// When the outcome was applied.
    pub completed_at: Option<DateTime<Utc>>,
    /// Full backup this incremental builds on. `None` for full backups.
    pub anchor_backup_id: Option<Uuid>,
    /// DEK the backup is encrypted with, if any.
    pub encryption_key_id: Option<Uuid>,
    /// Scope the DEK came from.
    pub encryption_scheme: Option<EncryptionScheme>,
    /// Changed block tracking details.
    pub cbt: CbtMetadata,
    /// Consistency achieved at capture time.
    pub consistency: ConsistencyMetadata,
    /// Latest restore-test findings.
    pub verification: VerificationMetadata,
    /// Why the backup failed.
    pub error_detail: Option<String>,
}

impl Backup {
    /// Only completed backups count toward compliance and chains.
    pub fn is_successful(&self) -> bool {
        self.status == BackupStatus::Completed
    }
}

/// A backup destination and its encryption strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageBackend {
    /// Operator-facing backend id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Authoritative for key selection of every backup written here.
    pub encryption_strategy: EncryptionStrategy,
    /// Use the global key when the preferred scope has none.
    pub allow_global_fallback: bool,
}

impl StorageBackend {
    /// Backend named after its id, with global fallback allowed.
    pub fn new(id: impl Into<String>, strategy: EncryptionStrategy) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            encryption_strategy: strategy,
            allow_global_fallback: true,
        }
    }

    /// Allow or forbid falling back to the global key.
    pub fn with_global_fallback(mut self, allowed: bool) -> Self {
        self.allow_global_fallback = allowed;
        self
    }

    /// Key target for a backup of `workload`; `None` when encryption is off.
    pub fn key_target(&self, workload: &WorkloadRef) -> Option<KeyTarget> {
        match self.encryption_strategy {
            EncryptionStrategy::Disabled => None,
            EncryptionStrategy::Global => Some(KeyTarget::Global),
            EncryptionStrategy::StorageBackend => Some(KeyTarget::StorageBackend(self.id.clone())),
            EncryptionStrategy::PerWorkload => Some(workload.key_target()),
        }
    }
}

/// Recurring backup configuration for one workload plus its chain state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSchedule {
    /// Unique id.
    pub id: Uuid,
    /// Workload being protected.
    pub workload: WorkloadRef,
    /// Backend the backups are written to.
    pub storage_backend_id: String,
    /// Disabled schedules are never due.
    pub enabled: bool,
    /// Minutes between planned backups.
    pub interval_minutes: u32,
    /// `None` means due immediately.
    pub next_run_at: Option<DateTime<Utc>>,

    /// Full vs. incremental preference.
    pub backup_mode_policy: BackupModePolicy,
    /// Incrementals allowed on one full before the next full.
    pub max_chain_length: u32,
    /// Weekday (UTC) on which a new full is taken.
    pub full_backup_day: Option<Weekday>,

    // Chain state, written only by the planner.
    /// Anchor of the open chain.
    pub last_full_backup_id: Option<Uuid>,
    /// Baseline checkpoint for the next incremental.
    pub checkpoint_name: Option<String>,
    /// Incrementals completed on the current anchor.
    pub incremental_count: u32,
    /// Backup still waiting for an outcome.
    pub pending_backup_id: Option<Uuid>,
    /// Cached incremental capability.
    pub capability: Capability,
    /// When `capability` was last probed.
    pub capability_checked_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency token, bumped on every write.
    pub row_version: u64,
}

impl BackupSchedule {
    /// Enabled schedule, hourly, `Auto` policy, chains of up to seven incrementals.
    pub fn new(workload: WorkloadRef, storage_backend_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workload,
            storage_backend_id: storage_backend_id.into(),
            enabled: true,
            interval_minutes: 60,
            next_run_at: None,
            backup_mode_policy: BackupModePolicy::Auto,
            max_chain_length: 7,
            full_backup_day: None,
            last_full_backup_id: None,
            checkpoint_name: None,
            incremental_count: 0,
            pending_backup_id: None,
            capability: Capability::Unknown,
            capability_checked_at: None,
            row_version: 0,
        }
    }

    /// Set the backup mode policy.
    pub fn with_policy(mut self, policy: BackupModePolicy) -> Self {
        self.backup_mode_policy = policy;
        self
    }

    /// Set the incremental limit per chain.
    pub fn with_max_chain_length(mut self, length: u32) -> Self {
        self.max_chain_length = length;
        self
    }

    /// Take a full backup every week on `day`.
    pub fn with_full_backup_day(mut self, day: Weekday) -> Self {
        self.full_backup_day = Some(day);
        self
    }

    /// Set the interval, at least one minute.
    pub fn with_interval_minutes(mut self, minutes: u32) -> Self {
        self.interval_minutes = minutes.max(1);
        self
    }

    /// A chain is open when there is an anchor and a baseline checkpoint.
    pub fn has_open_chain(&self) -> bool {
        self.last_full_backup_id.is_some() && self.checkpoint_name.is_some()
    }

    /// Enabled, not waiting on a backup, and past `next_run_at`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.pending_backup_id.is_none()
            && self.next_run_at.map_or(true, |next| next <= now)
    }
}

/// Why the planner chose the backup type it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    /// The schedule only takes full backups.
    FullOnlyPolicy,
    /// No anchor or checkpoint to build on.
    NoChain,
    /// The capability probe gave no answer.
    CapabilityUnknown,
    /// The workload cannot take incrementals.
    Incapable,
    /// The workload stopped supporting incrementals mid-chain.
    CapabilityLost,
    /// Weekly full backup day.
    FullBackupDay,
    /// The chain reached `max_chain_length`.
    ChainLengthReached,
    /// Incremental on the open chain.
    ContinueChain,
}

impl PlanReason {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanReason::FullOnlyPolicy => "full_only_policy",
            PlanReason::NoChain => "no_chain",
            PlanReason::CapabilityUnknown => "capability_unknown",
            PlanReason::Incapable => "incapable",
            PlanReason::CapabilityLost => "capability_lost",
            PlanReason::FullBackupDay => "full_backup_day",
            PlanReason::ChainLengthReached => "chain_length_reached",
            PlanReason::ContinueChain => "continue_chain",
        }
    }
}

/// A backup the planner has committed to, ready for key resolution and
/// hand-off to the execution collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Backup record created for this plan.
    pub backup_id: Uuid,
    /// Schedule the plan was made for.
    pub schedule_id: Uuid,
    /// Workload being protected.
    pub workload: WorkloadRef,
    /// Full or incremental.
    pub backup_type: BackupType,
    /// Why the planner chose `backup_type`.
    pub reason: PlanReason,
    /// Full backup an incremental builds on.
    pub anchor_backup_id: Option<Uuid>,
    /// Checkpoint an incremental diffs against.
    pub checkpoint_baseline: Option<String>,
    /// Scope the backup's key must come from; `None` when unencrypted.
    pub key_target: Option<KeyTarget>,
    /// Whether the global key may stand in for `key_target`.
    pub allow_key_fallback: bool,
    /// Filled in once the key hierarchy has resolved the key.
    pub key: Option<KeyHandle>,
    /// Tick time the plan was made at.
    pub planned_at: DateTime<Utc>,
}

/// Completion callback payload from the execution collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
    /// Whether execution succeeded.
    pub success: bool,
    /// Required and non-zero for incrementals.
    pub changed_blocks_count: Option<u64>,
    /// Block size in bytes.
    pub block_size: Option<u64>,
    /// Checkpoint the next incremental should use as its baseline.
    pub new_checkpoint_name: Option<String>,
    /// Applications were quiesced before capture.
    pub application_consistent: bool,
    /// Guest freeze outcome.
    pub freeze_status: FreezeStatus,
    /// Set on failure reports.
    pub error_detail: Option<String>,
}

impl CompletionReport {
    /// Successful report with no CBT details.
    pub fn success() -> Self {
        Self {
            success: true,
            changed_blocks_count: None,
            block_size: None,
            new_checkpoint_name: None,
            application_consistent: false,
            freeze_status: FreezeStatus::NotAttempted,
            error_detail: None,
        }
    }

    /// Failed report carrying `detail`.
    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_detail: Some(detail.into()),
            ..Self::success()
        }
    }

    /// Set the checkpoint the backup produced.
    pub fn with_checkpoint(mut self, name: impl Into<String>) -> Self {
        self.new_checkpoint_name = Some(name.into());
        self
    }

    /// Set the changed block count and block size.
    pub fn with_changed_blocks(mut self, count: u64, block_size: u64) -> Self {
        self.changed_blocks_count = Some(count);
        self.block_size = Some(block_size);
        self
    }

    /// Set consistency details.
    pub fn with_consistency(mut self, application_consistent: bool, freeze: FreezeStatus) -> Self {
        self.application_consistent = application_consistent;
        self.freeze_status = freeze;
        self
    }
}

/// Verification callback payload.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationReport {
    /// Whether a restore test has run.
    pub verified: bool,
    /// Verdict of the restore test.
    pub status: VerificationStatus,
    /// Verification job id.
    pub job_id: Option<Uuid>,
    /// Database tables found in the restored image.
    pub table_count: Option<u64>,
    /// Size of the restored image.
    pub size_bytes: Option<u64>,
    /// How long the restore test took.
    pub duration_seconds: Option<f64>,
    /// Failure detail from the verifier.
    pub error: Option<String>,
}
