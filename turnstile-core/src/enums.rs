//! Status and discriminator enums for TURNSTILE entities.
//!
//! Every enum persisted to storage carries `as_db_str`/`from_db_str` codecs so
//! that any durable store can hold it as a plain string without leaking
//! serde_json formatting into the schema.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// ENTITY TYPE
// ============================================================================

/// Entity type discriminator for polymorphic references and storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum EntityType {
    Turn,
    Receipt,
    Edge,
}

// ============================================================================
// TURN STATE
// ============================================================================

/// Lifecycle state of an [`AgentTurn`](crate::AgentTurn).
///
/// ```text
/// created → leased → executing ──┬─→ awaiting_handoff ──┐
///                                ├─→ awaiting_approval ─┤
///                                └──────────────────────┴─→ completed
///                                                        ├─→ failed
///                                                        └─→ escalated
/// any non-terminal ─(reaper)─→ stale ─→ leased | failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TurnState {
    /// Turn exists but no executor owns it yet
    Created,
    /// An executor holds a live lease but has not reported starting
    Leased,
    /// Application logic is running under a live lease
    Executing,
    /// Execution paused at a boundary requiring another agent
    AwaitingHandoff,
    /// Execution paused at a boundary requiring a human
    AwaitingApproval,
    /// Terminal: turn finished with a deliverable
    Completed,
    /// Terminal: turn finished unsuccessfully
    Failed,
    /// Terminal: turn was escalated out of the kernel's purview
    Escalated,
    /// Lease expired without a terminal transition; eligible for recovery
    Stale,
}

impl TurnState {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TurnState::Created => "created",
            TurnState::Leased => "leased",
            TurnState::Executing => "executing",
            TurnState::AwaitingHandoff => "awaiting_handoff",
            TurnState::AwaitingApproval => "awaiting_approval",
            TurnState::Completed => "completed",
            TurnState::Failed => "failed",
            TurnState::Escalated => "escalated",
            TurnState::Stale => "stale",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, TurnStateParseError> {
        match s.to_lowercase().as_str() {
            "created" => Ok(TurnState::Created),
            "leased" => Ok(TurnState::Leased),
            "executing" => Ok(TurnState::Executing),
            "awaiting_handoff" => Ok(TurnState::AwaitingHandoff),
            "awaiting_approval" => Ok(TurnState::AwaitingApproval),
            "completed" => Ok(TurnState::Completed),
            "failed" => Ok(TurnState::Failed),
            "escalated" => Ok(TurnState::Escalated),
            "stale" => Ok(TurnState::Stale),
            _ => Err(TurnStateParseError(s.to_string())),
        }
    }

    /// Check if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnState::Completed | TurnState::Failed | TurnState::Escalated
        )
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for TurnState {
    type Err = TurnStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid turn state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnStateParseError(pub String);

impl fmt::Display for TurnStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid turn state: {}", self.0)
    }
}

impl std::error::Error for TurnStateParseError {}

// ============================================================================
// RECEIPT STATUS
// ============================================================================

/// Status of an inbound delivery record.
///
/// A receipt is immutable except for the single transition out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum ReceiptStatus {
    /// Recorded but not yet bound to a turn
    Pending,
    /// Bound to exactly one turn
    Bound,
    /// Redelivery of an already-recorded key (audit row)
    Duplicate,
    /// Pending past the ingress threshold with no bound turn
    Stuck,
}

impl ReceiptStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Bound => "bound",
            ReceiptStatus::Duplicate => "duplicate",
            ReceiptStatus::Stuck => "stuck",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, ReceiptStatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ReceiptStatus::Pending),
            "bound" => Ok(ReceiptStatus::Bound),
            "duplicate" => Ok(ReceiptStatus::Duplicate),
            "stuck" => Ok(ReceiptStatus::Stuck),
            _ => Err(ReceiptStatusParseError(s.to_string())),
        }
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = ReceiptStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid receipt status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptStatusParseError(pub String);

impl fmt::Display for ReceiptStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid receipt status: {}", self.0)
    }
}

impl std::error::Error for ReceiptStatusParseError {}

// ============================================================================
// EDGE TYPE
// ============================================================================

/// Kind of causal link between two turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum EdgeType {
    /// Work handed to another agent
    Handoff,
    /// Work raised to a higher authority
    Escalation,
    /// Work retried after a failure
    Retry,
}

impl EdgeType {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EdgeType::Handoff => "handoff",
            EdgeType::Escalation => "escalation",
            EdgeType::Retry => "retry",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EdgeTypeParseError> {
        match s.to_lowercase().as_str() {
            "handoff" => Ok(EdgeType::Handoff),
            "escalation" => Ok(EdgeType::Escalation),
            "retry" => Ok(EdgeType::Retry),
            _ => Err(EdgeTypeParseError(s.to_string())),
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for EdgeType {
    type Err = EdgeTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid edge type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeTypeParseError(pub String);

impl fmt::Display for EdgeTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid edge type: {}", self.0)
    }
}

impl std::error::Error for EdgeTypeParseError {}

// ============================================================================
// TERMINAL OUTCOME
// ============================================================================

/// Outcome reported by a lease holder when terminating a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TerminalOutcome {
    Completed,
    Failed,
    Escalated,
}

impl TerminalOutcome {
    /// The turn state this outcome terminates into.
    pub fn terminal_state(&self) -> TurnState {
        match self {
            TerminalOutcome::Completed => TurnState::Completed,
            TerminalOutcome::Failed => TurnState::Failed,
            TerminalOutcome::Escalated => TurnState::Escalated,
        }
    }
}

impl fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.terminal_state().as_db_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_state_roundtrip() {
        for state in [
            TurnState::Created,
            TurnState::Leased,
            TurnState::Executing,
            TurnState::AwaitingHandoff,
            TurnState::AwaitingApproval,
            TurnState::Completed,
            TurnState::Failed,
            TurnState::Escalated,
            TurnState::Stale,
        ] {
            let db_str = state.as_db_str();
            let parsed = TurnState::from_db_str(db_str).unwrap();
            assert_eq!(state, parsed);
        }
    }

    #[test]
    fn test_turn_state_terminal() {
        assert!(TurnState::Completed.is_terminal());
        assert!(TurnState::Failed.is_terminal());
        assert!(TurnState::Escalated.is_terminal());
        assert!(!TurnState::Stale.is_terminal());
        assert!(!TurnState::Executing.is_terminal());
    }

    #[test]
    fn test_receipt_status_roundtrip() {
        for status in [
            ReceiptStatus::Pending,
            ReceiptStatus::Bound,
            ReceiptStatus::Duplicate,
            ReceiptStatus::Stuck,
        ] {
            let parsed = ReceiptStatus::from_db_str(status.as_db_str()).unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_edge_type_roundtrip() {
        for edge_type in [EdgeType::Handoff, EdgeType::Escalation, EdgeType::Retry] {
            let parsed = EdgeType::from_db_str(edge_type.as_db_str()).unwrap();
            assert_eq!(edge_type, parsed);
        }
    }

    #[test]
    fn test_invalid_db_strings_rejected() {
        assert!(TurnState::from_db_str("running").is_err());
        assert!(ReceiptStatus::from_db_str("done").is_err());
        assert!(EdgeType::from_db_str("fork").is_err());
    }

    #[test]
    fn test_terminal_outcome_maps_to_terminal_state() {
        for outcome in [
            TerminalOutcome::Completed,
            TerminalOutcome::Failed,
            TerminalOutcome::Escalated,
        ] {
            assert!(outcome.terminal_state().is_terminal());
        }
    }
}
