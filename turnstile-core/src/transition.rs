//! Pure turn-lifecycle transition validation.
//!
//! The transition function is deliberately free of storage concerns: it
//! answers only "is this edge defined", never "who may take it". Lease
//! ownership and deliverable checks belong to the kernel, which layers them
//! on top before committing a transition through compare-and-swap.

use crate::{TransitionError, TurnState};

/// All lifecycle edges defined for a turn.
///
/// ```text
/// created → leased → executing → {awaiting_handoff, awaiting_approval}
///                              → {completed, failed, escalated}
/// awaiting_* → {completed, failed, escalated}
/// any non-terminal → stale        (reaper only)
/// stale → leased | failed
/// ```
pub fn can_transition(from: TurnState, to: TurnState) -> bool {
    use TurnState::*;
    match (from, to) {
        (Created, Leased) => true,
        (Leased, Executing) => true,
        (Executing, AwaitingHandoff) => true,
        (Executing, AwaitingApproval) => true,
        (Executing, Completed) | (Executing, Failed) | (Executing, Escalated) => true,
        // A paused turn terminates when the boundary resolves.
        (AwaitingHandoff, Completed) | (AwaitingHandoff, Failed) | (AwaitingHandoff, Escalated) => {
            true
        }
        (AwaitingApproval, Completed)
        | (AwaitingApproval, Failed)
        | (AwaitingApproval, Escalated) => true,
        // A resumed turn goes back through executing.
        (AwaitingHandoff, Executing) | (AwaitingApproval, Executing) => true,
        // Reaper marks any non-terminal turn stale.
        (from, Stale) if !from.is_terminal() && from != Stale => true,
        // Recovery: a new owner leases a stale turn, or retries are exhausted.
        (Stale, Leased) | (Stale, Failed) => true,
        _ => false,
    }
}

/// Validate a lifecycle edge, returning the typed error the kernel propagates.
pub fn validate_transition(from: TurnState, to: TurnState) -> Result<(), TransitionError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError::Invalid { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TurnState::*;

    #[test]
    fn test_happy_path_edges() {
        assert!(can_transition(Created, Leased));
        assert!(can_transition(Leased, Executing));
        assert!(can_transition(Executing, Completed));
        assert!(can_transition(Executing, AwaitingHandoff));
        assert!(can_transition(AwaitingHandoff, Completed));
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        for terminal in [Completed, Failed, Escalated] {
            for to in [
                Created,
                Leased,
                Executing,
                AwaitingHandoff,
                AwaitingApproval,
                Completed,
                Failed,
                Escalated,
                Stale,
            ] {
                assert!(
                    !can_transition(terminal, to),
                    "{terminal} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn test_stale_reachable_from_non_terminal_only() {
        assert!(can_transition(Created, Stale));
        assert!(can_transition(Leased, Stale));
        assert!(can_transition(Executing, Stale));
        assert!(can_transition(AwaitingHandoff, Stale));
        assert!(can_transition(AwaitingApproval, Stale));
        assert!(!can_transition(Stale, Stale));
        assert!(!can_transition(Completed, Stale));
    }

    #[test]
    fn test_stale_resolves_to_leased_or_failed() {
        assert!(can_transition(Stale, Leased));
        assert!(can_transition(Stale, Failed));
        assert!(!can_transition(Stale, Executing));
        assert!(!can_transition(Stale, Completed));
    }

    #[test]
    fn test_no_lease_skipping() {
        // Execution must pass through the leased state.
        assert!(!can_transition(Created, Executing));
        assert!(!can_transition(Created, Completed));
    }

    #[test]
    fn test_validate_transition_error_carries_edge() {
        let err = validate_transition(Completed, Leased).unwrap_err();
        match err {
            TransitionError::Invalid { from, to } => {
                assert_eq!(from, Completed);
                assert_eq!(to, Leased);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
