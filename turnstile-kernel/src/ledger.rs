//! Receipt ledger: durable, replay-safe record of inbound deliveries.
//!
//! Exactly one terminal deliverable is ever recorded per distinct idempotency
//! key. Replays after the terminal outcome is known return the cached outcome
//! without re-invoking application logic. The ledger never deduplicates turns
//! itself; it deduplicates deliveries and hands the survivor to the state
//! machine.

use std::sync::Arc;

use chrono::Utc;
use turnstile_core::{
    AgentId, DeliverableId, EntityType, InboxReceipt, KernelError, KernelResult, LedgerError,
    PayloadHash, ReceiptId, ReceiptStatus, SessionId, StorageError, TurnId,
};
use turnstile_storage::{ReceiptUpdate, TurnStoreTrait};

/// Result of recording an inbound delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// First delivery under this key; a receipt was recorded as pending.
    New { receipt: InboxReceipt },
    /// Redelivery with a matching payload fingerprint. Callers must not
    /// re-execute side effects; the original outcome (when known) rides along.
    Duplicate {
        receipt: InboxReceipt,
        terminal_deliverable_id: Option<DeliverableId>,
    },
    /// Same key, different payload fingerprint: sender bug or hash collision.
    /// Surfaced to operators, never bound.
    DuplicateConflict { receipt: InboxReceipt },
}

/// Records and deduplicates inbound delivery attempts.
#[derive(Clone)]
pub struct ReceiptLedger {
    store: Arc<dyn TurnStoreTrait>,
}

impl ReceiptLedger {
    pub fn new(store: Arc<dyn TurnStoreTrait>) -> Self {
        Self { store }
    }

    /// Record an inbound delivery attempt.
    ///
    /// The first delivery under a key creates a `pending` receipt. A
    /// redelivery with the same payload hash refreshes `last_seen_at`, writes
    /// a `duplicate` audit row, and returns the bound turn's terminal
    /// deliverable when one exists. A redelivery with a different hash is
    /// flagged as a conflict and never binds.
    ///
    /// An insert that loses the key-index race re-reads and resolves as a
    /// duplicate, so concurrent submits of the same key are at-least-once
    /// safe.
    pub fn submit(
        &self,
        idempotency_key: &str,
        payload_hash: PayloadHash,
        session_id: SessionId,
        agent_id: AgentId,
    ) -> KernelResult<SubmitOutcome> {
        match self.store.receipt_get_by_key(idempotency_key)? {
            Some(existing) => self.resolve_redelivery(existing, payload_hash, session_id, agent_id),
            None => {
                let now = Utc::now();
                let receipt = InboxReceipt {
                    receipt_id: turnstile_core::new_entity_id(),
                    idempotency_key: idempotency_key.to_string(),
                    payload_hash,
                    session_id,
                    agent_id,
                    status: ReceiptStatus::Pending,
                    bound_turn_id: None,
                    first_seen_at: now,
                    last_seen_at: now,
                };
                match self.store.receipt_insert(&receipt) {
                    Ok(()) => {
                        tracing::debug!(
                            receipt_id = %receipt.receipt_id,
                            idempotency_key,
                            "receipt recorded"
                        );
                        Ok(SubmitOutcome::New { receipt })
                    }
                    Err(KernelError::Storage(StorageError::InsertConflict { .. })) => {
                        // Lost the key-index race; the winner's row is now the
                        // record of truth.
                        let existing = self.store.receipt_get_by_key(idempotency_key)?.ok_or(
                            StorageError::NotFound {
                                entity_type: EntityType::Receipt,
                                id: receipt.receipt_id,
                            },
                        )?;
                        self.resolve_redelivery(existing, payload_hash, session_id, agent_id)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Bind a pending receipt to the turn it created.
    ///
    /// Idempotent when called again with the same turn; binding a receipt
    /// already bound elsewhere is [`LedgerError::AlreadyBound`].
    pub fn bind(&self, receipt_id: ReceiptId, turn_id: TurnId) -> KernelResult<()> {
        let receipt = self.load(receipt_id)?;

        match receipt.status {
            ReceiptStatus::Bound => match receipt.bound_turn_id {
                Some(bound) if bound == turn_id => Ok(()),
                Some(bound) => Err(LedgerError::AlreadyBound {
                    receipt_id,
                    bound_turn_id: bound,
                }
                .into()),
                // Bound without a turn id never happens through this ledger.
                None => Err(LedgerError::NotPending {
                    receipt_id,
                    status: receipt.status,
                }
                .into()),
            },
            ReceiptStatus::Pending => {
                self.store.receipt_cas_update(
                    receipt_id,
                    ReceiptStatus::Pending,
                    ReceiptUpdate {
                        status: Some(ReceiptStatus::Bound),
                        bound_turn_id: Some(turn_id),
                        ..Default::default()
                    },
                )?;
                Ok(())
            }
            status => Err(LedgerError::NotPending { receipt_id, status }.into()),
        }
    }

    /// Mark a receipt stuck: pending past the ingress threshold with no bound
    /// turn. Reaper-only; signals an ingress-side defect, not a turn-side one.
    pub fn mark_stuck(&self, receipt_id: ReceiptId) -> KernelResult<()> {
        let receipt = self.load(receipt_id)?;
        match receipt.status {
            ReceiptStatus::Stuck => Ok(()),
            ReceiptStatus::Pending => {
                self.store.receipt_cas_update(
                    receipt_id,
                    ReceiptStatus::Pending,
                    ReceiptUpdate {
                        status: Some(ReceiptStatus::Stuck),
                        ..Default::default()
                    },
                )?;
                tracing::warn!(receipt_id = %receipt_id, "receipt marked stuck");
                Ok(())
            }
            status => Err(LedgerError::NotPending { receipt_id, status }.into()),
        }
    }

    fn resolve_redelivery(
        &self,
        existing: InboxReceipt,
        payload_hash: PayloadHash,
        session_id: SessionId,
        agent_id: AgentId,
    ) -> KernelResult<SubmitOutcome> {
        let now = Utc::now();
        let conflicting = existing.payload_hash != payload_hash;

        // Audit row for the redelivery attempt; never indexed, never bound.
        let audit = InboxReceipt {
            receipt_id: turnstile_core::new_entity_id(),
            idempotency_key: existing.idempotency_key.clone(),
            payload_hash,
            session_id,
            agent_id,
            status: ReceiptStatus::Duplicate,
            bound_turn_id: None,
            first_seen_at: now,
            last_seen_at: now,
        };
        self.store.receipt_insert(&audit)?;

        if conflicting {
            tracing::warn!(
                receipt_id = %existing.receipt_id,
                idempotency_key = %existing.idempotency_key,
                "duplicate-conflict: payload hash mismatch under same idempotency key"
            );
            return Ok(SubmitOutcome::DuplicateConflict { receipt: existing });
        }

        // Refresh last_seen_at on the original; the status CAS tolerates
        // whatever state it is in.
        let refreshed = self.store.receipt_cas_update(
            existing.receipt_id,
            existing.status,
            ReceiptUpdate {
                last_seen_at: Some(now),
                ..Default::default()
            },
        )?;

        let terminal_deliverable_id = match refreshed.bound_turn_id {
            Some(turn_id) => self
                .store
                .turn_get(turn_id)?
                .and_then(|t| t.terminal_deliverable_id),
            None => None,
        };

        tracing::debug!(
            receipt_id = %refreshed.receipt_id,
            idempotency_key = %refreshed.idempotency_key,
            cached_outcome = terminal_deliverable_id.is_some(),
            "duplicate delivery resolved from ledger"
        );

        Ok(SubmitOutcome::Duplicate {
            receipt: refreshed,
            terminal_deliverable_id,
        })
    }

    fn load(&self, receipt_id: ReceiptId) -> KernelResult<InboxReceipt> {
        self.store.receipt_get(receipt_id)?.ok_or_else(|| {
            StorageError::NotFound {
                entity_type: EntityType::Receipt,
                id: receipt_id,
            }
            .into()
        })
    }
}
