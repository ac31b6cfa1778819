//! RPO compliance evaluation
//!
//! [`ComplianceEvaluator`] is a pure function of (policy assignment, backup
//! history, now). [`ComplianceMonitor`] feeds it from the backup store and
//! keeps the latest result per workload.

/// Pure status computation.
pub mod evaluator;
/// Store-backed refresh and caching.
pub mod monitor;

pub use evaluator::{
    evaluate_rpo, ComplianceEvaluator, CompliancePolicy, ComplianceRecord, ComplianceStatus,
    PolicyAssignment,
};
pub use monitor::{ComplianceMonitor, MemoryPolicyDirectory, PolicyDirectory};

use crate::chain::ChainError;
use thiserror::Error;

/// Errors raised while refreshing compliance
#[derive(Error, Debug)]
pub enum ComplianceError {
    /// Backup history could not be read.
    #[error("Backup history unavailable: {0}")]
    History(#[from] ChainError),

    /// The policy directory failed.
    #[error("Policy lookup failed: {0}")]
    Policy(String),
}
