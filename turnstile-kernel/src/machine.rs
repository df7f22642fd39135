//! Turn state machine: binds receipts to turns and commits lifecycle
//! transitions under a valid lease.
//!
//! The state machine never deduplicates deliveries (that is the ledger's job)
//! and never decides ownership (that is the lease manager's job). It validates
//! that a reported transition is defined, that the reporter holds the lease,
//! and that terminal transitions carry a deliverable pointer, then commits the
//! result through compare-and-swap on the turn's `version`.

use std::sync::Arc;

use chrono::Utc;
use turnstile_core::{
    AgentId, AgentTurn, DeliverableId, EdgeType, EntityType, ExecutionEdge, KernelResult,
    OwnerToken, ReceiptId, SessionId, StorageError, TerminalOutcome, TransitionError, TurnId,
    TurnState,
};
use turnstile_core::{new_entity_id, validate_transition};
use turnstile_storage::{LeasePatch, TurnStoreTrait, TurnUpdate};
use uuid::Uuid;

use crate::ledger::ReceiptLedger;

/// Validates and applies turn-lifecycle transitions.
#[derive(Clone)]
pub struct TurnStateMachine {
    store: Arc<dyn TurnStoreTrait>,
    ledger: ReceiptLedger,
}

impl TurnStateMachine {
    pub fn new(store: Arc<dyn TurnStoreTrait>, ledger: ReceiptLedger) -> Self {
        Self { store, ledger }
    }

    /// Create a turn for a pending receipt, or return the turn the receipt is
    /// already bound to.
    ///
    /// Turn insert and receipt bind are two single-record writes with no
    /// cross-record atomicity; a crash between them leaves a pending receipt
    /// and an orphan turn, and re-driving this call binds a fresh turn. A
    /// concurrent binder winning the status CAS resolves the same way: the
    /// bound turn wins, the loser's insert is abandoned.
    pub fn create_or_bind_turn(
        &self,
        receipt_id: ReceiptId,
        session_id: SessionId,
        agent_id: AgentId,
    ) -> KernelResult<TurnId> {
        let receipt = self
            .store
            .receipt_get(receipt_id)?
            .ok_or(StorageError::NotFound {
                entity_type: EntityType::Receipt,
                id: receipt_id,
            })?;

        if let Some(bound) = receipt.bound_turn_id {
            return Ok(bound);
        }

        let now = Utc::now();
        let turn = AgentTurn {
            turn_id: new_entity_id(),
            session_id,
            agent_id,
            state: TurnState::Created,
            lease_owner_token: None,
            lease_expires_at: None,
            version: 0,
            terminal_deliverable_id: None,
            causation_receipt_id: receipt_id,
            failure_annotations: vec![],
            created_at: now,
            updated_at: now,
        };
        self.store.turn_insert(&turn)?;

        match self.ledger.bind(receipt_id, turn.turn_id) {
            Ok(()) => {
                tracing::debug!(
                    turn_id = %turn.turn_id,
                    receipt_id = %receipt_id,
                    "turn created and bound"
                );
                Ok(turn.turn_id)
            }
            Err(err) => {
                // A concurrent binder won; return its turn and abandon ours.
                if let Some(winner) = self
                    .store
                    .receipt_get(receipt_id)?
                    .and_then(|r| r.bound_turn_id)
                {
                    tracing::debug!(
                        receipt_id = %receipt_id,
                        winner = %winner,
                        "lost bind race; resolving to the bound turn"
                    );
                    Ok(winner)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Report that application logic started under a held lease.
    pub fn report_executing(&self, turn_id: TurnId, owner_token: OwnerToken) -> KernelResult<()> {
        let turn = self.load_held(turn_id, owner_token)?;
        validate_transition(turn.state, TurnState::Executing)?;

        self.store.turn_cas_update(
            turn_id,
            turn.version,
            TurnUpdate {
                state: Some(TurnState::Executing),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Commit a terminal outcome together with its deliverable pointer.
    ///
    /// The state change, the write-once deliverable pointer, and the lease
    /// clear land in a single compare-and-swap; there is no observable moment
    /// where a terminal turn lacks its deliverable.
    ///
    /// # Errors
    ///
    /// [`TransitionError::MissingDeliverable`] when the pointer is nil, and
    /// the usual lease/transition errors otherwise.
    pub fn report_terminal(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        outcome: TerminalOutcome,
        deliverable_id: DeliverableId,
    ) -> KernelResult<()> {
        if deliverable_id == Uuid::nil() {
            return Err(TransitionError::MissingDeliverable { turn_id }.into());
        }

        let turn = self.load_held(turn_id, owner_token)?;
        let terminal_state = outcome.terminal_state();
        validate_transition(turn.state, terminal_state)?;

        self.store.turn_cas_update(
            turn_id,
            turn.version,
            TurnUpdate {
                state: Some(terminal_state),
                terminal_deliverable_id: Some(deliverable_id),
                lease: Some(LeasePatch::Clear),
                ..Default::default()
            },
        )?;

        tracing::info!(
            turn_id = %turn_id,
            outcome = %outcome,
            deliverable_id = %deliverable_id,
            "turn terminated"
        );
        Ok(())
    }

    /// Report a boundary requiring a human decision. The reporter keeps its
    /// lease; heartbeat or release it while the approval is outstanding.
    pub fn report_approval_wait(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
    ) -> KernelResult<()> {
        let turn = self.load_held(turn_id, owner_token)?;
        validate_transition(turn.state, TurnState::AwaitingApproval)?;

        self.store.turn_cas_update(
            turn_id,
            turn.version,
            TurnUpdate {
                state: Some(TurnState::AwaitingApproval),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Report a boundary requiring another agent: transition to
    /// `awaiting_handoff`, create the successor turn, and link the two with an
    /// execution edge.
    ///
    /// The transition commits before the successor and edge are written. A
    /// failure after the commit leaves an `awaiting_handoff` turn with no
    /// outbound edge; re-driving this call detects that and finishes the
    /// successor/edge writes without a second transition.
    pub fn report_handoff(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        next_agent_id: AgentId,
        edge_type: EdgeType,
    ) -> KernelResult<TurnId> {
        let turn = self.load_held(turn_id, owner_token)?;

        match turn.state {
            TurnState::AwaitingHandoff => {
                // Re-drive: if the edge already exists, the handoff finished.
                if let Some(edge) = self.store.edge_list_from(turn_id)?.into_iter().next() {
                    return Ok(edge.to_turn_id);
                }
            }
            state => {
                validate_transition(state, TurnState::AwaitingHandoff)?;
                self.store.turn_cas_update(
                    turn_id,
                    turn.version,
                    TurnUpdate {
                        state: Some(TurnState::AwaitingHandoff),
                        ..Default::default()
                    },
                )?;
            }
        }

        let now = Utc::now();
        // The successor stays rooted at the receipt that started the work, so
        // the causation chain from any turn resolves to the inbound delivery.
        let successor = AgentTurn {
            turn_id: new_entity_id(),
            session_id: turn.session_id,
            agent_id: next_agent_id,
            state: TurnState::Created,
            lease_owner_token: None,
            lease_expires_at: None,
            version: 0,
            terminal_deliverable_id: None,
            causation_receipt_id: turn.causation_receipt_id,
            failure_annotations: vec![],
            created_at: now,
            updated_at: now,
        };
        self.store.turn_insert(&successor)?;

        self.store.edge_insert(&ExecutionEdge {
            edge_id: new_entity_id(),
            from_turn_id: turn_id,
            to_turn_id: successor.turn_id,
            edge_type,
            created_at: now,
        })?;

        tracing::info!(
            turn_id = %turn_id,
            successor = %successor.turn_id,
            edge_type = %edge_type,
            "handoff recorded"
        );
        Ok(successor.turn_id)
    }

    /// Load a turn and check the reporter holds its live lease.
    fn load_held(&self, turn_id: TurnId, owner_token: OwnerToken) -> KernelResult<AgentTurn> {
        let turn = self
            .store
            .turn_get(turn_id)?
            .ok_or(StorageError::NotFound {
                entity_type: EntityType::Turn,
                id: turn_id,
            })?;

        if !turn.is_lease_holder(owner_token, Utc::now()) {
            return Err(TransitionError::NotLeaseHolder {
                turn_id,
                token: owner_token,
            }
            .into());
        }
        Ok(turn)
    }
}
