//! Core entity structures

use crate::{
    AgentId, DeliverableId, EdgeId, EdgeType, EntityId, EntityType, OwnerToken, PayloadHash,
    ReceiptId, ReceiptStatus, SessionId, Timestamp, TurnId, TurnState,
};
use serde::{Deserialize, Serialize};

/// Reference to an entity by type and ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EntityRef {
    pub entity_type: EntityType,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub id: EntityId,
}

/// AgentTurn - one bounded unit of agent execution.
///
/// The turn record is the only mutable shared resource in the kernel. Every
/// mutation path (lease grant/heartbeat/release, state transition, deliverable
/// write) goes through compare-and-swap on `version`, so transitions for a
/// single turn are totally ordered. Terminal turns are never deleted; they are
/// retained for audit and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentTurn {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub turn_id: TurnId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub session_id: SessionId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub agent_id: AgentId,
    pub state: TurnState,
    /// Token of the current lease holder; None when no lease is held
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub lease_owner_token: Option<OwnerToken>,
    /// When the current lease lapses; None when no lease is held
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub lease_expires_at: Option<Timestamp>,
    /// Monotonic counter for compare-and-swap; every mutation supplies the
    /// version it read and increments it atomically
    pub version: u64,
    /// Set exactly once, never overwritten; non-null implies a terminal state
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub terminal_deliverable_id: Option<DeliverableId>,
    /// The receipt whose binding created this turn
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub causation_receipt_id: ReceiptId,
    /// Annotations appended by `fail()` calls; the turn stays recoverable
    pub failure_annotations: Vec<FailureAnnotation>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
}

impl AgentTurn {
    /// Check whether a live (non-expired) lease is held at `now`.
    pub fn has_live_lease(&self, now: Timestamp) -> bool {
        match (self.lease_owner_token, self.lease_expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at,
            _ => false,
        }
    }

    /// Check whether `token` holds a live lease at `now`.
    pub fn is_lease_holder(&self, token: OwnerToken, now: Timestamp) -> bool {
        self.lease_owner_token == Some(token) && self.has_live_lease(now)
    }

    /// Check if the turn reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Failure annotation recorded when a lease holder abandons a turn via
/// `fail()` without advancing its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FailureAnnotation {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub owner_token: OwnerToken,
    pub reason: String,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub recorded_at: Timestamp,
}

/// ExecutionEdge - directed causal link between turns.
///
/// Edges form a DAG: `to_turn_id` always references a turn created strictly
/// after the transition on `from_turn_id` that produced the edge, so no turn
/// can causally precede itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ExecutionEdge {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub edge_id: EdgeId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub from_turn_id: TurnId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub to_turn_id: TurnId,
    pub edge_type: EdgeType,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
}

/// InboxReceipt - one record per inbound delivery attempt.
///
/// Immutable except for the single `status`/`bound_turn_id` transition out of
/// `Pending` and the `last_seen_at` refresh on redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct InboxReceipt {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub receipt_id: ReceiptId,
    /// Caller-supplied key, unique per logical sender scope
    pub idempotency_key: String,
    /// SHA-256 fingerprint of the delivered payload
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "byte"))]
    pub payload_hash: PayloadHash,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub session_id: SessionId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub agent_id: AgentId,
    pub status: ReceiptStatus,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "uuid"))]
    pub bound_turn_id: Option<TurnId>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub first_seen_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub last_seen_at: Timestamp,
}

impl InboxReceipt {
    /// How long the receipt has been pending at `now`.
    pub fn pending_age(&self, now: Timestamp) -> chrono::Duration {
        now - self.first_seen_at
    }
}
