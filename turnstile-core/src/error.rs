//! Error types for TURNSTILE operations
//!
//! All kernel-detected failures are returned as typed results so callers can
//! distinguish "safe to retry" from "must investigate". Nothing in the kernel
//! panics on a contended record.

use crate::{EntityType, OwnerToken, ReceiptId, ReceiptStatus, TurnId, TurnState};
use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Insert failed for {entity_type:?}: {reason}")]
    InsertConflict { entity_type: EntityType, reason: String },

    #[error("Version conflict on turn {turn_id}: expected {expected}, found {found}")]
    VersionConflict {
        turn_id: TurnId,
        expected: u64,
        found: u64,
    },

    #[error("Status conflict on receipt {receipt_id}: expected {expected}, found {found}")]
    StatusConflict {
        receipt_id: ReceiptId,
        expected: ReceiptStatus,
        found: ReceiptStatus,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Lease manager errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    /// Another live lease exists; retryable after backoff or expiry.
    #[error("Lease conflict on turn {turn_id}: held by {holder} until {expires_at}")]
    Conflict {
        turn_id: TurnId,
        holder: OwnerToken,
        expires_at: crate::Timestamp,
    },

    /// Caller does not hold the lease, or it already expired; must re-acquire.
    #[error("Lease on turn {turn_id} not owned by {token}")]
    NotOwned { turn_id: TurnId, token: OwnerToken },

    /// Terminal turns never grant leases again.
    #[error("Turn {turn_id} is terminal ({state}); no lease may be granted")]
    TurnTerminal { turn_id: TurnId, state: TurnState },
}

/// Receipt ledger errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Receipt already bound to a different turn. Binding the same turn twice
    /// is an idempotent success, not this error.
    #[error("Receipt {receipt_id} already bound to turn {bound_turn_id}")]
    AlreadyBound {
        receipt_id: ReceiptId,
        bound_turn_id: TurnId,
    },

    /// Same idempotency key, different payload fingerprint. Surfaced to
    /// operators, never silently resolved.
    #[error("Payload hash mismatch for idempotency key {idempotency_key:?}")]
    DuplicateConflict { idempotency_key: String },

    #[error("Receipt {receipt_id} is not pending (status {status})")]
    NotPending {
        receipt_id: ReceiptId,
        status: ReceiptStatus,
    },
}

/// Turn state machine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// Attempted lifecycle edge is not defined. Programmer error.
    #[error("Invalid transition {from} -> {to}")]
    Invalid { from: TurnState, to: TurnState },

    /// Terminal transition attempted without a deliverable pointer. Fatal to
    /// the attempt, not to the turn.
    #[error("Terminal transition on turn {turn_id} requires a deliverable pointer")]
    MissingDeliverable { turn_id: TurnId },

    /// Caller reported progress on a turn it does not hold.
    #[error("Turn {turn_id} is not leased by token {token}")]
    NotLeaseHolder { turn_id: TurnId, token: OwnerToken },
}

/// Top-level error type aggregating all kernel error domains.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl KernelError {
    /// Whether the caller may safely retry the same call.
    ///
    /// Lease conflicts and CAS races are the expected cost of concurrent
    /// executors; everything else signals a caller bug or an operator-level
    /// problem.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KernelError::Lease(LeaseError::Conflict { .. })
                | KernelError::Storage(StorageError::VersionConflict { .. })
                | KernelError::Storage(StorageError::StatusConflict { .. })
        )
    }
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::new_entity_id;
    use chrono::Utc;

    #[test]
    fn test_lease_conflict_is_retryable() {
        let err: KernelError = LeaseError::Conflict {
            turn_id: new_entity_id(),
            holder: new_entity_id(),
            expires_at: Utc::now(),
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_version_conflict_is_retryable() {
        let err: KernelError = StorageError::VersionConflict {
            turn_id: new_entity_id(),
            expected: 3,
            found: 4,
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_caller_bugs_are_not_retryable() {
        let not_owned: KernelError = LeaseError::NotOwned {
            turn_id: new_entity_id(),
            token: new_entity_id(),
        }
        .into();
        assert!(!not_owned.is_retryable());

        let invalid: KernelError = TransitionError::Invalid {
            from: TurnState::Completed,
            to: TurnState::Leased,
        }
        .into();
        assert!(!invalid.is_retryable());

        let conflict: KernelError = LedgerError::DuplicateConflict {
            idempotency_key: "k1".to_string(),
        }
        .into();
        assert!(!conflict.is_retryable());
    }
}
