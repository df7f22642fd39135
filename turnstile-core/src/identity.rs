//! Identity types for TURNSTILE entities

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, making IDs naturally sortable by creation time.
pub type EntityId = Uuid;

/// Identifier of a single unit of agent execution.
pub type TurnId = EntityId;

/// Identifier of an inbound delivery record.
pub type ReceiptId = EntityId;

/// Identifier of the session a turn belongs to.
pub type SessionId = EntityId;

/// Identifier of the agent executing a turn.
pub type AgentId = EntityId;

/// Identifier of a causal link between turns.
pub type EdgeId = EntityId;

/// Pointer to the output artifact recorded when a turn terminates.
pub type DeliverableId = EntityId;

/// Opaque token identifying the current lease holder of a turn.
pub type OwnerToken = EntityId;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Duration in milliseconds for TTL and threshold values.
pub type DurationMs = i64;

/// SHA-256 fingerprint of an inbound payload, used to detect near-duplicate
/// deliveries that share an idempotency key.
pub type PayloadHash = [u8; 32];

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Compute the SHA-256 fingerprint of an inbound payload.
pub fn compute_payload_hash(payload: &[u8]) -> PayloadHash {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}
