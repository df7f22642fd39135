//! TURNSTILE Core - Entity Types
//!
//! Pure data structures and pure functions for the turn coordination kernel.
//! All other crates depend on this. This crate contains no storage and no IO:
//! the transition table, lease typestate, and error taxonomy live here so that
//! every component validates against the same definitions.

pub mod config;
pub mod entities;
pub mod enums;
pub mod error;
pub mod identity;
pub mod lease;
pub mod transition;

pub use config::KernelConfig;
pub use entities::{AgentTurn, EntityRef, ExecutionEdge, FailureAnnotation, InboxReceipt};
pub use enums::{
    EdgeType, EdgeTypeParseError, EntityType, ReceiptStatus, ReceiptStatusParseError,
    TerminalOutcome, TurnState, TurnStateParseError,
};
pub use error::{
    KernelError, KernelResult, LeaseError, LedgerError, StorageError, TransitionError,
};
pub use identity::{
    compute_payload_hash, new_entity_id, AgentId, DeliverableId, DurationMs, EdgeId, EntityId,
    OwnerToken, PayloadHash, ReceiptId, SessionId, Timestamp, TurnId,
};
pub use lease::{Granted, Lease, LeaseData, LeaseState, Released};
pub use transition::{can_transition, validate_transition};
