//! Test fixtures and proptest generators for TURNSTILE.
//!
//! Fixture constructors build minimal valid entities; `seed_*` helpers insert
//! them into a store and return the stored value.

use chrono::Utc;
use proptest::prelude::*;
use turnstile_core::{
    compute_payload_hash, new_entity_id, AgentId, AgentTurn, EdgeType, ExecutionEdge,
    InboxReceipt, ReceiptId, ReceiptStatus, SessionId, TurnState,
};
use turnstile_storage::TurnStoreTrait;

/// A fresh turn in `Created` with zeroed lease fields.
pub fn make_turn(session_id: SessionId, agent_id: AgentId, causation_receipt_id: ReceiptId) -> AgentTurn {
    let now = Utc::now();
    AgentTurn {
        turn_id: new_entity_id(),
        session_id,
        agent_id,
        state: TurnState::Created,
        lease_owner_token: None,
        lease_expires_at: None,
        version: 0,
        terminal_deliverable_id: None,
        causation_receipt_id,
        failure_annotations: vec![],
        created_at: now,
        updated_at: now,
    }
}

/// A turn with a customization hook applied before returning.
pub fn make_turn_with(
    session_id: SessionId,
    agent_id: AgentId,
    causation_receipt_id: ReceiptId,
    customize: impl FnOnce(&mut AgentTurn),
) -> AgentTurn {
    let mut turn = make_turn(session_id, agent_id, causation_receipt_id);
    customize(&mut turn);
    turn
}

/// Insert a fresh turn in the given state and return it.
pub fn seed_turn(store: &dyn TurnStoreTrait, state: TurnState) -> AgentTurn {
    seed_turn_with(store, |t| t.state = state)
}

/// Insert a customized fresh turn and return it.
pub fn seed_turn_with(
    store: &dyn TurnStoreTrait,
    customize: impl FnOnce(&mut AgentTurn),
) -> AgentTurn {
    let mut turn = make_turn(new_entity_id(), new_entity_id(), new_entity_id());
    customize(&mut turn);
    store.turn_insert(&turn).expect("fixture turn insert");
    turn
}

/// A pending receipt for the given key.
pub fn make_receipt(idempotency_key: &str) -> InboxReceipt {
    let now = Utc::now();
    InboxReceipt {
        receipt_id: new_entity_id(),
        idempotency_key: idempotency_key.to_string(),
        payload_hash: compute_payload_hash(idempotency_key.as_bytes()),
        session_id: new_entity_id(),
        agent_id: new_entity_id(),
        status: ReceiptStatus::Pending,
        bound_turn_id: None,
        first_seen_at: now,
        last_seen_at: now,
    }
}

/// Insert a customized receipt and return it.
pub fn seed_receipt(
    store: &dyn TurnStoreTrait,
    idempotency_key: &str,
    customize: impl FnOnce(&mut InboxReceipt),
) -> InboxReceipt {
    let mut receipt = make_receipt(idempotency_key);
    customize(&mut receipt);
    store.receipt_insert(&receipt).expect("fixture receipt insert");
    receipt
}

/// An edge between two turns.
pub fn make_edge(from: AgentTurn, to: AgentTurn, edge_type: EdgeType) -> ExecutionEdge {
    ExecutionEdge {
        edge_id: new_entity_id(),
        from_turn_id: from.turn_id,
        to_turn_id: to.turn_id,
        edge_type,
        created_at: Utc::now(),
    }
}

// ============================================================================
// PROPTEST STRATEGIES
// ============================================================================

/// Strategy over every turn state.
pub fn arb_turn_state() -> impl Strategy<Value = TurnState> {
    prop_oneof![
        Just(TurnState::Created),
        Just(TurnState::Leased),
        Just(TurnState::Executing),
        Just(TurnState::AwaitingHandoff),
        Just(TurnState::AwaitingApproval),
        Just(TurnState::Completed),
        Just(TurnState::Failed),
        Just(TurnState::Escalated),
        Just(TurnState::Stale),
    ]
}

/// Strategy over edge types.
pub fn arb_edge_type() -> impl Strategy<Value = EdgeType> {
    prop_oneof![
        Just(EdgeType::Handoff),
        Just(EdgeType::Escalation),
        Just(EdgeType::Retry),
    ]
}

/// Strategy over plausible idempotency keys.
pub fn arb_idempotency_key() -> impl Strategy<Value = String> {
    "[a-z0-9]{4,24}(-[a-z0-9]{1,8})?".prop_map(|s| s.to_string())
}
