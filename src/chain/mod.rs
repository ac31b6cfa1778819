//! Backup chain planning
//!
//! Owns the chain-state fields of [`BackupSchedule`] and the lifecycle of
//! [`Backup`] rows from planning through completion or failure.

/// Planning decisions and outcome application.
pub mod planner;
/// Persistence seam.
pub mod store;
/// Schedules, backups, plans and reports.
pub mod types;

pub use planner::{decide, CapabilityProbe, ChainPlanner, Decision, ProbeError};
pub use store::{BackupStore, MemoryBackupStore};
pub use types::{
    Backup, BackupModePolicy, BackupSchedule, BackupStatus, BackupType, Capability, CbtMetadata,
    CompletionReport, ConsistencyMetadata, FreezeStatus, Plan, PlanReason, StorageBackend,
    VerificationMetadata, VerificationReport, VerificationStatus, WorkloadRef,
};

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while planning or applying backup outcomes
#[derive(Error, Debug)]
pub enum ChainError {
    /// No schedule with this id.
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    /// No backup with this id.
    #[error("Backup not found: {0}")]
    BackupNotFound(Uuid),

    /// The schedule points at an unknown backend.
    #[error("Storage backend not found: {0}")]
    StorageBackendNotFound(String),

    /// An operation would break the chain's structure.
    #[error("Chain invariant violation: {0}")]
    ChainInvariantViolation(String),

    /// The capability probe failed.
    #[error("Incremental capability unknown: {0}")]
    CapabilityUnknown(String),

    /// Outcome for a backup that is already terminal.
    #[error("Stale report for backup {backup_id}: already {status:?}")]
    StaleCompletionReport {
        /// Backup the report was for.
        backup_id: Uuid,
        /// Status it already had.
        status: BackupStatus,
    },

    /// The schedule is still waiting on an earlier backup.
    #[error("Schedule {schedule_id} already has backup {backup_id} in flight")]
    BackupInFlight {
        /// Schedule that was asked to plan.
        schedule_id: Uuid,
        /// Backup it is waiting on.
        backup_id: Uuid,
    },

    /// Optimistic write lost against another writer.
    #[error("Schedule {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    /// Checkpoint name outside `[A-Za-z0-9._-]`.
    #[error("Invalid checkpoint name: {0}")]
    InvalidCheckpointName(String),

    /// Backing store failure.
    #[error("Backup storage error: {0}")]
    Storage(String),
}
