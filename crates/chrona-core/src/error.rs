//! Error types for Chrona

use std::fmt;

use thiserror::Error;

use crate::VarId;

/// Why a transaction gave up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// Every allowed attempt hit a validation conflict
    RetriesExhausted,
    /// The caller-supplied deadline elapsed between attempts
    DeadlineExceeded,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::RetriesExhausted => write!(f, "retries exhausted"),
            AbortReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Core Chrona errors
#[derive(Error, Debug)]
pub enum ChronaError {
    // Transaction errors
    #[error("Validation conflict on {var}: read version is stale")]
    ValidationConflict { var: VarId },

    #[error("Transaction aborted after {attempts} attempts: {reason}")]
    TransactionAborted { attempts: u32, reason: AbortReason },

    #[error("Transaction already finished")]
    TransactionFinished,

    // Guard errors
    #[error("Unsafe mutation context for {var:?}: {context}")]
    UnsafeMutationContext { var: Option<VarId>, context: String },

    #[error("Lock ordering violation: {next} locked after {previous}")]
    LockOrderingViolation { previous: VarId, next: VarId },

    // Engine errors
    #[error("A convergence run is already active on this registry")]
    RunInProgress,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Variable not found: {0}")]
    VariableNotFound(VarId),

    #[error("Code block failed: {0}")]
    Block(String),

    // Runtime errors
    #[error("Coordinator is closed")]
    CoordinatorClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChronaError {
    /// Transient contention the gateway absorbs by retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChronaError::ValidationConflict { .. })
    }

    /// Programmer or gateway bugs that must never be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChronaError::UnsafeMutationContext { .. } | ChronaError::LockOrderingViolation { .. }
        )
    }
}

/// Result type for Chrona operations
pub type ChronaResult<T> = Result<T, ChronaError>;
