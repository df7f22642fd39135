//! TURNSTILE Storage - Storage Trait and In-Memory Implementation
//!
//! Defines the storage abstraction the kernel mutates through. The contract
//! assumes a single linearizable store offering per-record compare-and-swap:
//! turns swap on `version`, receipts swap on `status`. No cross-record
//! atomicity is offered; operations spanning a receipt and a turn are written
//! by the kernel to be re-driveable after partial failure.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use turnstile_core::{
    AgentTurn, DeliverableId, EntityType, ExecutionEdge, FailureAnnotation, InboxReceipt,
    KernelError, KernelResult, OwnerToken, ReceiptId, ReceiptStatus, SessionId, StorageError,
    Timestamp, TurnId, TurnState,
};
use uuid::Uuid;

// ============================================================================
// UPDATE TYPES
// ============================================================================

/// Lease mutation carried by a [`TurnUpdate`].
///
/// A plain `Option` cannot distinguish "leave the lease alone" from "clear
/// it", so the patch is explicit.
#[derive(Debug, Clone, PartialEq)]
pub enum LeasePatch {
    /// Write a new holder and expiry
    Grant {
        owner_token: OwnerToken,
        expires_at: Timestamp,
    },
    /// Clear both lease fields
    Clear,
}

/// Update payload for turns. Applied atomically under CAS on `version`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnUpdate {
    /// New lifecycle state
    pub state: Option<TurnState>,
    /// Lease grant or clear
    pub lease: Option<LeasePatch>,
    /// Terminal deliverable pointer; write-once
    pub terminal_deliverable_id: Option<DeliverableId>,
    /// Failure annotation to append
    pub push_failure_annotation: Option<FailureAnnotation>,
}

/// Update payload for receipts. Applied atomically under CAS on `status`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiptUpdate {
    /// New receipt status
    pub status: Option<ReceiptStatus>,
    /// Turn the receipt is bound to
    pub bound_turn_id: Option<TurnId>,
    /// Redelivery timestamp refresh
    pub last_seen_at: Option<Timestamp>,
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Storage trait for TURNSTILE entities.
///
/// Implementations provide durable persistence for turns, receipts, and
/// execution edges with single-record linearizable compare-and-swap.
pub trait TurnStoreTrait: Send + Sync {
    // === Turn Operations ===

    /// Insert a new turn. Fails if the id already exists.
    fn turn_insert(&self, turn: &AgentTurn) -> KernelResult<()>;

    /// Get a turn by ID.
    fn turn_get(&self, id: TurnId) -> KernelResult<Option<AgentTurn>>;

    /// Apply an update to a turn iff its stored version equals
    /// `expected_version`. On success the version is incremented and
    /// `updated_at` stamped; the updated record is returned.
    ///
    /// # Errors
    ///
    /// - [`StorageError::VersionConflict`] when another writer won the race;
    ///   the caller re-reads and retries.
    /// - [`StorageError::InsertConflict`] when the update would overwrite an
    ///   already-set terminal deliverable pointer with a different value.
    fn turn_cas_update(
        &self,
        id: TurnId,
        expected_version: u64,
        update: TurnUpdate,
    ) -> KernelResult<AgentTurn>;

    /// List non-terminal turns whose lease expiry has passed `now`.
    fn turn_list_lease_expired(&self, now: Timestamp) -> KernelResult<Vec<AgentTurn>>;

    /// List turns belonging to a session.
    fn turn_list_by_session(&self, session_id: SessionId) -> KernelResult<Vec<AgentTurn>>;

    // === Receipt Operations ===

    /// Insert a new receipt. For statuses other than
    /// [`ReceiptStatus::Duplicate`] the idempotency key is indexed and a
    /// second insert under the same key fails with
    /// [`StorageError::InsertConflict`]; duplicate audit rows are never
    /// indexed.
    fn receipt_insert(&self, receipt: &InboxReceipt) -> KernelResult<()>;

    /// Get a receipt by ID.
    fn receipt_get(&self, id: ReceiptId) -> KernelResult<Option<InboxReceipt>>;

    /// Get the indexed (original) receipt for an idempotency key.
    fn receipt_get_by_key(&self, idempotency_key: &str) -> KernelResult<Option<InboxReceipt>>;

    /// Apply an update to a receipt iff its stored status equals
    /// `expected_status`. Returns the updated record.
    fn receipt_cas_update(
        &self,
        id: ReceiptId,
        expected_status: ReceiptStatus,
        update: ReceiptUpdate,
    ) -> KernelResult<InboxReceipt>;

    /// List receipts with a given status.
    fn receipt_list_by_status(&self, status: ReceiptStatus) -> KernelResult<Vec<InboxReceipt>>;

    /// List pending receipts first seen before `cutoff`.
    fn receipt_list_pending_older_than(&self, cutoff: Timestamp)
        -> KernelResult<Vec<InboxReceipt>>;

    // === Edge Operations ===

    /// Insert a new execution edge. Fails if the id already exists.
    fn edge_insert(&self, edge: &ExecutionEdge) -> KernelResult<()>;

    /// List edges originating from a turn.
    fn edge_list_from(&self, turn_id: TurnId) -> KernelResult<Vec<ExecutionEdge>>;

    /// List edges pointing at a turn.
    fn edge_list_to(&self, turn_id: TurnId) -> KernelResult<Vec<ExecutionEdge>>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// In-memory reference implementation of [`TurnStoreTrait`].
///
/// Linearizability per record comes from taking the map's write lock for the
/// whole read-check-write of a CAS. Suitable for tests and single-process
/// deployments; any durable store with per-record CAS can replace it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    turns: RwLock<HashMap<TurnId, AgentTurn>>,
    receipts: RwLock<HashMap<ReceiptId, InboxReceipt>>,
    /// idempotency key -> original receipt id (duplicate audit rows excluded)
    receipt_keys: RwLock<HashMap<String, ReceiptId>>,
    edges: RwLock<HashMap<Uuid, ExecutionEdge>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(_: impl std::fmt::Debug) -> KernelError {
    StorageError::LockPoisoned.into()
}

impl TurnStoreTrait for MemoryStore {
    // === Turn Operations ===

    fn turn_insert(&self, turn: &AgentTurn) -> KernelResult<()> {
        let mut turns = self.turns.write().map_err(poisoned)?;
        if turns.contains_key(&turn.turn_id) {
            return Err(StorageError::InsertConflict {
                entity_type: EntityType::Turn,
                reason: "already exists".to_string(),
            }
            .into());
        }
        turns.insert(turn.turn_id, turn.clone());
        Ok(())
    }

    fn turn_get(&self, id: TurnId) -> KernelResult<Option<AgentTurn>> {
        let turns = self.turns.read().map_err(poisoned)?;
        Ok(turns.get(&id).cloned())
    }

    fn turn_cas_update(
        &self,
        id: TurnId,
        expected_version: u64,
        update: TurnUpdate,
    ) -> KernelResult<AgentTurn> {
        let mut turns = self.turns.write().map_err(poisoned)?;
        let turn = turns.get_mut(&id).ok_or(StorageError::NotFound {
            entity_type: EntityType::Turn,
            id,
        })?;

        if turn.version != expected_version {
            return Err(StorageError::VersionConflict {
                turn_id: id,
                expected: expected_version,
                found: turn.version,
            }
            .into());
        }

        if let Some(deliverable_id) = update.terminal_deliverable_id {
            match turn.terminal_deliverable_id {
                Some(existing) if existing != deliverable_id => {
                    return Err(StorageError::InsertConflict {
                        entity_type: EntityType::Turn,
                        reason: "terminal deliverable already set".to_string(),
                    }
                    .into());
                }
                _ => turn.terminal_deliverable_id = Some(deliverable_id),
            }
        }

        if let Some(state) = update.state {
            turn.state = state;
        }
        match update.lease {
            Some(LeasePatch::Grant {
                owner_token,
                expires_at,
            }) => {
                turn.lease_owner_token = Some(owner_token);
                turn.lease_expires_at = Some(expires_at);
            }
            Some(LeasePatch::Clear) => {
                turn.lease_owner_token = None;
                turn.lease_expires_at = None;
            }
            None => {}
        }
        if let Some(annotation) = update.push_failure_annotation {
            turn.failure_annotations.push(annotation);
        }

        turn.version += 1;
        turn.updated_at = Utc::now();
        Ok(turn.clone())
    }

    fn turn_list_lease_expired(&self, now: Timestamp) -> KernelResult<Vec<AgentTurn>> {
        let turns = self.turns.read().map_err(poisoned)?;
        let mut expired: Vec<AgentTurn> = turns
            .values()
            .filter(|t| {
                !t.is_terminal()
                    && t.state != TurnState::Stale
                    && matches!(t.lease_expires_at, Some(expires_at) if expires_at < now)
            })
            .cloned()
            .collect();
        expired.sort_by_key(|t| t.lease_expires_at);
        Ok(expired)
    }

    fn turn_list_by_session(&self, session_id: SessionId) -> KernelResult<Vec<AgentTurn>> {
        let turns = self.turns.read().map_err(poisoned)?;
        let mut result: Vec<AgentTurn> = turns
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        result.sort_by_key(|t| t.created_at);
        Ok(result)
    }

    // === Receipt Operations ===

    fn receipt_insert(&self, receipt: &InboxReceipt) -> KernelResult<()> {
        // Lock order: receipt_keys before receipts, everywhere both are held.
        let mut keys = self.receipt_keys.write().map_err(poisoned)?;
        let mut receipts = self.receipts.write().map_err(poisoned)?;

        if receipts.contains_key(&receipt.receipt_id) {
            return Err(StorageError::InsertConflict {
                entity_type: EntityType::Receipt,
                reason: "already exists".to_string(),
            }
            .into());
        }
        if receipt.status != ReceiptStatus::Duplicate {
            if keys.contains_key(&receipt.idempotency_key) {
                return Err(StorageError::InsertConflict {
                    entity_type: EntityType::Receipt,
                    reason: "idempotency key already recorded".to_string(),
                }
                .into());
            }
            keys.insert(receipt.idempotency_key.clone(), receipt.receipt_id);
        }
        receipts.insert(receipt.receipt_id, receipt.clone());
        Ok(())
    }

    fn receipt_get(&self, id: ReceiptId) -> KernelResult<Option<InboxReceipt>> {
        let receipts = self.receipts.read().map_err(poisoned)?;
        Ok(receipts.get(&id).cloned())
    }

    fn receipt_get_by_key(&self, idempotency_key: &str) -> KernelResult<Option<InboxReceipt>> {
        let keys = self.receipt_keys.read().map_err(poisoned)?;
        let receipts = self.receipts.read().map_err(poisoned)?;
        Ok(keys
            .get(idempotency_key)
            .and_then(|id| receipts.get(id))
            .cloned())
    }

    fn receipt_cas_update(
        &self,
        id: ReceiptId,
        expected_status: ReceiptStatus,
        update: ReceiptUpdate,
    ) -> KernelResult<InboxReceipt> {
        let mut receipts = self.receipts.write().map_err(poisoned)?;
        let receipt = receipts.get_mut(&id).ok_or(StorageError::NotFound {
            entity_type: EntityType::Receipt,
            id,
        })?;

        if receipt.status != expected_status {
            return Err(StorageError::StatusConflict {
                receipt_id: id,
                expected: expected_status,
                found: receipt.status,
            }
            .into());
        }

        if let Some(status) = update.status {
            receipt.status = status;
        }
        if let Some(turn_id) = update.bound_turn_id {
            receipt.bound_turn_id = Some(turn_id);
        }
        if let Some(last_seen_at) = update.last_seen_at {
            receipt.last_seen_at = last_seen_at;
        }

        Ok(receipt.clone())
    }

    fn receipt_list_by_status(&self, status: ReceiptStatus) -> KernelResult<Vec<InboxReceipt>> {
        let receipts = self.receipts.read().map_err(poisoned)?;
        let mut result: Vec<InboxReceipt> = receipts
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.first_seen_at);
        Ok(result)
    }

    fn receipt_list_pending_older_than(
        &self,
        cutoff: Timestamp,
    ) -> KernelResult<Vec<InboxReceipt>> {
        let receipts = self.receipts.read().map_err(poisoned)?;
        let mut result: Vec<InboxReceipt> = receipts
            .values()
            .filter(|r| r.status == ReceiptStatus::Pending && r.first_seen_at < cutoff)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.first_seen_at);
        Ok(result)
    }

    // === Edge Operations ===

    fn edge_insert(&self, edge: &ExecutionEdge) -> KernelResult<()> {
        let mut edges = self.edges.write().map_err(poisoned)?;
        if edges.contains_key(&edge.edge_id) {
            return Err(StorageError::InsertConflict {
                entity_type: EntityType::Edge,
                reason: "already exists".to_string(),
            }
            .into());
        }
        edges.insert(edge.edge_id, edge.clone());
        Ok(())
    }

    fn edge_list_from(&self, turn_id: TurnId) -> KernelResult<Vec<ExecutionEdge>> {
        let edges = self.edges.read().map_err(poisoned)?;
        let mut result: Vec<ExecutionEdge> = edges
            .values()
            .filter(|e| e.from_turn_id == turn_id)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.created_at);
        Ok(result)
    }

    fn edge_list_to(&self, turn_id: TurnId) -> KernelResult<Vec<ExecutionEdge>> {
        let edges = self.edges.read().map_err(poisoned)?;
        let mut result: Vec<ExecutionEdge> = edges
            .values()
            .filter(|e| e.to_turn_id == turn_id)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.created_at);
        Ok(result)
    }
}

// ============================================================================
// TESTS
// ============================================================================
