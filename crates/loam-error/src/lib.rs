use std::time::Duration;

use thiserror::Error;

/// Primary error type for LoamDB engine operations.
///
/// Structured variants for the failure classes the MVCC core surfaces;
/// the transaction driver decides how to react (restart the transaction,
/// mark the resource corrupt, or give up).
#[derive(Error, Debug)]
pub enum LoamError {
    // === Transaction outcomes ===
    /// The calling transaction lost a write-write race and must restart.
    #[error("transaction must roll back: {reason}")]
    Rollback { reason: RollbackReason },

    /// A blocking wait observed the waiter's interrupt flag.
    #[error("interrupted while waiting for a write-write dependency")]
    Interrupted,

    /// A bounded wait elapsed without the awaited event.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },

    // === Misuse ===
    /// The caller violated an API precondition.
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    // === Integrity ===
    /// An MVCC invariant was found violated; the resource is corrupt.
    #[error("corrupted version chain: {detail}")]
    CorruptedState { detail: String },

    /// A version's prune callback failed during a sweep.
    #[error("version prune callback failed: {detail}")]
    PruneFailed { detail: String },
}

/// Why a transaction was told to roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// Another writer published a newer (or equal) version handle first.
    LostRace,
    /// A chain entry belongs to a concurrent transaction that committed
    /// or may still commit.
    WriteConflict,
    /// A blocking write-write wait could not clear the dependency.
    DependencyUnresolved,
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LostRace => f.write_str("lost race to a newer version"),
            Self::WriteConflict => f.write_str("write-write conflict with a concurrent transaction"),
            Self::DependencyUnresolved => {
                f.write_str("write-write dependency did not clear within the wait bound")
            }
        }
    }
}

impl LoamError {
    /// Create a rollback error.
    #[must_use]
    pub const fn rollback(reason: RollbackReason) -> Self {
        Self::Rollback { reason }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }

    /// Create a corrupted-state error.
    pub fn corrupted(detail: impl Into<String>) -> Self {
        Self::CorruptedState {
            detail: detail.into(),
        }
    }

    /// Whether this is a transient error that may succeed when the caller
    /// restarts its transaction.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Rollback { .. } | Self::Timeout { .. })
    }

    /// Whether this error condemns the resource it was raised on.
    #[must_use]
    pub const fn is_fatal_for_resource(&self) -> bool {
        matches!(self, Self::CorruptedState { .. })
    }
}

/// Result type alias using `LoamError`.
pub type Result<T> = std::result::Result<T, LoamError>;
