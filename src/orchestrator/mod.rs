//! Orchestration facade
//!
//! [`BackupOrchestrator`] is the entry point for the job dispatcher and the
//! API layer. It performs no I/O of its own; everything external sits behind
//! the collaborator traits in [`collaborators`].

/// Traits for everything outside the core.
pub mod collaborators;
/// The orchestrator itself.
pub mod facade;

pub use collaborators::{Clock, ExecutionCollaborator, ExecutionError, ExecutionRequest, ManualClock, SystemClock};
pub use facade::{ApplyOutcome, BackupOrchestrator, TickSummary};
