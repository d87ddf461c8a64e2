//! Fence Error Types
//!
//! Every fencing failure surfaces as a [`FenceError`]. Errors raised by the
//! business call itself travel separately in [`InvokeError::Business`] so the
//! caller gets them back untouched.

use thiserror::Error;

use super::status::{FencePhase, FenceStatus};

/// Error category, used by callers to pick a reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceErrorKind {
    /// Process-level misconfiguration, fatal at first use
    Configuration,
    /// Phase already handled for this branch; treat as done
    DuplicateBranch,
    /// Needs operator attention
    InconsistentState,
    /// Transient; the coordinator is expected to redeliver
    Storage,
    /// Caller passed something unusable
    InvalidArgument,
}

#[derive(Error, Debug, Clone)]
pub enum FenceError {
    // === Configuration Errors ===
    #[error("Fence data source is not registered (neither fence-specific nor default)")]
    DataSourceNeedInjected,

    #[error("Fence transaction manager is not registered (neither fence-specific nor default)")]
    TransactionManagerNeedInjected,

    #[error("Invalid fence configuration: {0}")]
    InvalidConfig(String),

    // === Branch Fencing Violations ===
    #[error("Duplicate branch call: xid={xid}, branch_id={branch_id} is already {status}")]
    DuplicateBranch {
        xid: String,
        branch_id: i64,
        status: FenceStatus,
    },

    #[error("Inconsistent fence state: {phase} for xid={xid}, branch_id={branch_id} found {status}")]
    InconsistentState {
        xid: String,
        branch_id: i64,
        phase: FencePhase,
        status: FenceStatus,
    },

    #[error("Fence record not found: xid={xid}, branch_id={branch_id}")]
    RecordNotFound { xid: String, branch_id: i64 },

    #[error("Fence status changed concurrently: xid={xid}, branch_id={branch_id}, expected {expected}")]
    StatusConflict {
        xid: String,
        branch_id: i64,
        expected: FenceStatus,
    },

    // === System Errors ===
    #[error("Fence storage error: {0}")]
    Storage(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl FenceError {
    pub fn kind(&self) -> FenceErrorKind {
        match self {
            FenceError::DataSourceNeedInjected
            | FenceError::TransactionManagerNeedInjected
            | FenceError::InvalidConfig(_) => FenceErrorKind::Configuration,
            FenceError::DuplicateBranch { .. } => FenceErrorKind::DuplicateBranch,
            FenceError::InconsistentState { .. }
            | FenceError::RecordNotFound { .. }
            | FenceError::StatusConflict { .. } => FenceErrorKind::InconsistentState,
            FenceError::Storage(_) => FenceErrorKind::Storage,
            FenceError::InvalidArgument(_) => FenceErrorKind::InvalidArgument,
        }
    }

    /// Stable error code for logs and remote error payloads
    pub fn code(&self) -> &'static str {
        match self {
            FenceError::DataSourceNeedInjected => "DATA_SOURCE_NEED_INJECTED",
            FenceError::TransactionManagerNeedInjected => "TRANSACTION_MANAGER_NEED_INJECTED",
            FenceError::InvalidConfig(_) => "INVALID_CONFIG",
            FenceError::DuplicateBranch { .. } => "DUPLICATE_BRANCH",
            FenceError::InconsistentState { .. } => "INCONSISTENT_STATE",
            FenceError::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            FenceError::StatusConflict { .. } => "STATUS_CONFLICT",
            FenceError::Storage(_) => "STORAGE_ERROR",
            FenceError::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }

    /// Whether redelivering the same phase call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FenceError::Storage(_) | FenceError::StatusConflict { .. }
        )
    }
}

impl From<sqlx::Error> for FenceError {
    fn from(e: sqlx::Error) -> Self {
        FenceError::Storage(e.to_string())
    }
}

/// Result of a fenced invocation that failed
///
/// Either side rolls back the whole local transaction.
#[derive(Error, Debug)]
pub enum InvokeError<E> {
    #[error(transparent)]
    Fence(#[from] FenceError),

    #[error("Business action failed: {0}")]
    Business(E),
}

impl<E> InvokeError<E> {
    /// Fencing error, if this is one
    pub fn as_fence(&self) -> Option<&FenceError> {
        match self {
            InvokeError::Fence(e) => Some(e),
            InvokeError::Business(_) => None,
        }
    }

    pub fn into_business(self) -> Option<E> {
        match self {
            InvokeError::Business(e) => Some(e),
            InvokeError::Fence(_) => None,
        }
    }
}
