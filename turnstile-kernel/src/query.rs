//! Replay-safe operational query surface.
//!
//! Read-only views over committed state, used by incident response and by the
//! reaper's operators. Nothing here mutates; every call is safe to run
//! repeatedly during an incident review.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use turnstile_core::{
    AgentTurn, EntityType, ExecutionEdge, InboxReceipt, KernelResult, ReceiptId, ReceiptStatus,
    SessionId, StorageError, TurnId, TurnState,
};
use turnstile_storage::TurnStoreTrait;

/// Everything known about one turn, assembled for incident reconstruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnTrace {
    pub turn: AgentTurn,
    /// The receipt that created this turn, when it still resolves
    pub causation_receipt: Option<InboxReceipt>,
    /// Edges pointing at this turn (who handed work here)
    pub inbound_edges: Vec<ExecutionEdge>,
    /// Edges leaving this turn (where work went next)
    pub outbound_edges: Vec<ExecutionEdge>,
}

impl TurnTrace {
    /// An `awaiting_handoff` turn with no outbound edge marks the window where
    /// a handoff transition committed but the edge write did not; callers
    /// should re-drive the handoff instead of assuming it completed.
    pub fn has_unresolved_handoff(&self) -> bool {
        self.turn.state == TurnState::AwaitingHandoff && self.outbound_edges.is_empty()
    }
}

/// Everything known about one receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptTrace {
    pub receipt: InboxReceipt,
    /// The turn the receipt bound to, when any
    pub bound_turn: Option<AgentTurn>,
    /// Edges leaving the bound turn
    pub outbound_edges: Vec<ExecutionEdge>,
}

/// Read-only operational views over the turn store and receipt ledger.
#[derive(Clone)]
pub struct QuerySurface {
    store: Arc<dyn TurnStoreTrait>,
}

impl QuerySurface {
    pub fn new(store: Arc<dyn TurnStoreTrait>) -> Self {
        Self { store }
    }

    /// Receipts pending longer than `threshold`, oldest first.
    pub fn list_aging_receipts(&self, threshold: Duration) -> KernelResult<Vec<InboxReceipt>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(threshold.as_millis() as i64));
        self.store.receipt_list_pending_older_than(cutoff)
    }

    /// Duplicate-delivery audit rows, optionally narrowed to one session.
    pub fn list_duplicate_receipts(
        &self,
        session_id: Option<SessionId>,
    ) -> KernelResult<Vec<InboxReceipt>> {
        let duplicates = self.store.receipt_list_by_status(ReceiptStatus::Duplicate)?;
        Ok(match session_id {
            Some(session_id) => duplicates
                .into_iter()
                .filter(|r| r.session_id == session_id)
                .collect(),
            None => duplicates,
        })
    }

    /// Receipts the reaper flagged as pending past the ingress threshold.
    pub fn list_stuck_receipts(&self) -> KernelResult<Vec<InboxReceipt>> {
        self.store.receipt_list_by_status(ReceiptStatus::Stuck)
    }

    /// Assemble the full trace for a turn.
    pub fn get_turn_trace(&self, turn_id: TurnId) -> KernelResult<TurnTrace> {
        let turn = self
            .store
            .turn_get(turn_id)?
            .ok_or(StorageError::NotFound {
                entity_type: EntityType::Turn,
                id: turn_id,
            })?;

        let causation_receipt = self.store.receipt_get(turn.causation_receipt_id)?;
        let inbound_edges = self.store.edge_list_to(turn_id)?;
        let outbound_edges = self.store.edge_list_from(turn_id)?;

        Ok(TurnTrace {
            turn,
            causation_receipt,
            inbound_edges,
            outbound_edges,
        })
    }

    /// Assemble the full trace for a receipt.
    pub fn get_receipt_trace(&self, receipt_id: ReceiptId) -> KernelResult<ReceiptTrace> {
        let receipt = self
            .store
            .receipt_get(receipt_id)?
            .ok_or(StorageError::NotFound {
                entity_type: EntityType::Receipt,
                id: receipt_id,
            })?;

        let bound_turn = match receipt.bound_turn_id {
            Some(turn_id) => self.store.turn_get(turn_id)?,
            None => None,
        };
        let outbound_edges = match receipt.bound_turn_id {
            Some(turn_id) => self.store.edge_list_from(turn_id)?,
            None => vec![],
        };

        Ok(ReceiptTrace {
            receipt,
            bound_turn,
            outbound_edges,
        })
    }
}
