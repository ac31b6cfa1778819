//! # vmbackup core
//!
//! Decision core of a VM and container backup system: which backup runs next
//! and whether it is full or incremental, which encryption key protects it,
//! and whether each workload currently meets its recovery point objective.
//!
//! The core moves no data and talks to no hypervisor. Execution, capability
//! probing, policy lookup and persistence all sit behind traits so the same
//! logic runs against in-memory stores in tests and Postgres in production.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vmbackup::chain::{BackupSchedule, MemoryBackupStore, StorageBackend, WorkloadRef};
//! use vmbackup::compliance::MemoryPolicyDirectory;
//! use vmbackup::config::CoreConfig;
//! use vmbackup::keys::{EncryptionStrategy, MemoryKeyStore};
//! use vmbackup::orchestrator::{BackupOrchestrator, SystemClock};
//! # use vmbackup::chain::{CapabilityProbe, ProbeError};
//! # use vmbackup::orchestrator::{ExecutionCollaborator, ExecutionError, ExecutionRequest};
//! # struct Probe;
//! # #[async_trait::async_trait]
//! # impl CapabilityProbe for Probe {
//! #     async fn probe_incremental_capability(&self, _: &BackupSchedule) -> Result<bool, ProbeError> { Ok(true) }
//! # }
//! # struct Dispatcher;
//! # #[async_trait::async_trait]
//! # impl ExecutionCollaborator for Dispatcher {
//! #     async fn submit(&self, _: ExecutionRequest) -> Result<(), ExecutionError> { Ok(()) }
//! # }
//!
//! # async fn example() -> vmbackup::Result<()> {
//! let orchestrator = BackupOrchestrator::from_config(
//!     &CoreConfig::default(),
//!     Arc::new(MemoryKeyStore::new()),
//!     Arc::new(MemoryBackupStore::new()),
//!     Arc::new(Probe),
//!     Arc::new(MemoryPolicyDirectory::new()),
//!     Arc::new(Dispatcher),
//!     Arc::new(SystemClock),
//! )?;
//!
//! orchestrator
//!     .register_storage_backend(&StorageBackend::new("nas", EncryptionStrategy::PerWorkload))
//!     .await?;
//! orchestrator
//!     .register_schedule(BackupSchedule::new(WorkloadRef::Vm("vm-101".into()), "nas"))
//!     .await?;
//!
//! let summary = orchestrator.run_tick().await?;
//! println!("planned {} backups", summary.planned.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`keys`]: KEK/DEK hierarchy, rotation, import/export
//! - [`chain`]: full/incremental chain planning and outcome application
//! - [`compliance`]: RPO evaluation and the compliance cache
//! - [`orchestrator`]: the facade composing the three per tick
//! - [`config`], [`metrics`]: ambient configuration and Prometheus counters

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Key hierarchy errors
    #[error("Key error: {0}")]
    Key(#[from] keys::KeyError),

    /// Chain planning errors
    #[error("Chain error: {0}")]
    Chain(#[from] chain::ChainError),

    /// Compliance evaluation errors
    #[error("Compliance error: {0}")]
    Compliance(#[from] compliance::ComplianceError),

    /// Execution collaborator errors
    #[error("Execution error: {0}")]
    Execution(#[from] orchestrator::ExecutionError),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a caller should treat an error. The core itself never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retrying later may succeed.
    Transient,
    /// The request or collaborator broke a contract; escalate.
    Contract,
    /// The referenced record does not exist.
    NotFound,
    /// Lost a race or hit an existing state.
    Conflict,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Contract => "contract",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
        }
    }
}

fn key_error_kind(err: &keys::KeyError) -> ErrorKind {
    use keys::KeyError::*;
    match err {
        KeyNotFound(_) => ErrorKind::NotFound,
        DuplicateActiveKey(_) | DuplicateKeyVersion { .. } | KeyInUse { .. } | ActiveKeyDelete(_) => {
            ErrorKind::Conflict
        }
        UnknownMasterKey(_) | InvalidMasterKey(_) | Wrap(_) => ErrorKind::Contract,
        Storage(_) => ErrorKind::Transient,
    }
}

fn chain_error_kind(err: &chain::ChainError) -> ErrorKind {
    use chain::ChainError::*;
    match err {
        ScheduleNotFound(_) | BackupNotFound(_) | StorageBackendNotFound(_) => ErrorKind::NotFound,
        ChainInvariantViolation(_) | InvalidCheckpointName(_) => ErrorKind::Contract,
        StaleCompletionReport { .. } | BackupInFlight { .. } | ConcurrentModification(_) => {
            ErrorKind::Conflict
        }
        CapabilityUnknown(_) | Storage(_) => ErrorKind::Transient,
    }
}

impl CoreError {
    /// Classify the error for the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Key(e) => key_error_kind(e),
            CoreError::Chain(e) => chain_error_kind(e),
            CoreError::Compliance(compliance::ComplianceError::History(e)) => chain_error_kind(e),
            CoreError::Compliance(compliance::ComplianceError::Policy(_)) => ErrorKind::Transient,
            CoreError::Execution(orchestrator::ExecutionError::Rejected(_)) => ErrorKind::Contract,
            CoreError::Execution(orchestrator::ExecutionError::Unavailable(_)) => ErrorKind::Transient,
            CoreError::Join(_) | CoreError::Internal(_) => ErrorKind::Transient,
        }
    }
}

/// Configuration structures and master key loading
pub mod config;

/// Encryption key hierarchy
pub mod keys;

/// Backup chain planning
pub mod chain;

/// RPO compliance evaluation
pub mod compliance;

/// Orchestration facade and collaborator traits
pub mod orchestrator;

/// Prometheus counters
pub mod metrics;
