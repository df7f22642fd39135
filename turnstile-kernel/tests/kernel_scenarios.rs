//! End-to-end scenarios driving the kernel facade the way collaborating
//! executors would: submit a receipt, bind a turn, acquire the lease, report
//! progress, and recover abandoned work through the reaper.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use turnstile_core::{
    compute_payload_hash, new_entity_id, EdgeType, KernelConfig, KernelError, LeaseError,
    TerminalOutcome, TurnState,
};
use turnstile_kernel::{Kernel, SubmitOutcome};

fn kernel() -> Kernel {
    Kernel::in_memory(KernelConfig::development())
}

/// Scenario 1: first delivery flows through to a completed turn.
#[test]
fn scenario_full_lifecycle() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();
    let h1 = compute_payload_hash(b"h1");

    let receipt = match kernel.submit_receipt("k1", h1, session, agent).unwrap() {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };

    let turn_id = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();

    let token = new_entity_id();
    let lease = kernel.acquire_lease(turn_id, token, None).unwrap();
    assert_eq!(lease.turn_id(), turn_id);

    kernel.report_executing(turn_id, token).unwrap();

    let d1 = new_entity_id();
    kernel
        .report_terminal(turn_id, token, TerminalOutcome::Completed, d1)
        .unwrap();

    let trace = kernel.queries().get_turn_trace(turn_id).unwrap();
    assert_eq!(trace.turn.state, TurnState::Completed);
    assert_eq!(trace.turn.terminal_deliverable_id, Some(d1));
    assert_eq!(
        trace.causation_receipt.as_ref().map(|r| r.receipt_id),
        Some(receipt.receipt_id)
    );
}

/// Scenario 2: replay with the same payload returns the cached outcome and
/// creates no new turn.
#[test]
fn scenario_duplicate_returns_cached_outcome() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();
    let h1 = compute_payload_hash(b"h1");

    let receipt = match kernel.submit_receipt("k1", h1, session, agent).unwrap() {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };
    let turn_id = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();
    let token = new_entity_id();
    kernel.acquire_lease(turn_id, token, None).unwrap();
    kernel.report_executing(turn_id, token).unwrap();
    let d1 = new_entity_id();
    kernel
        .report_terminal(turn_id, token, TerminalOutcome::Completed, d1)
        .unwrap();

    match kernel.submit_receipt("k1", h1, session, agent).unwrap() {
        SubmitOutcome::Duplicate {
            receipt: original,
            terminal_deliverable_id,
        } => {
            assert_eq!(original.receipt_id, receipt.receipt_id);
            assert_eq!(original.bound_turn_id, Some(turn_id));
            assert_eq!(terminal_deliverable_id, Some(d1));
        }
        other => panic!("expected Duplicate, got {other:?}"),
    }

    // Still exactly one bound turn for the key.
    let resolved = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();
    assert_eq!(resolved, turn_id);
}

/// Scenario 3: same key, different payload fingerprint never binds.
#[test]
fn scenario_duplicate_conflict() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();

    kernel
        .submit_receipt("k1", compute_payload_hash(b"h1"), session, agent)
        .unwrap();

    match kernel
        .submit_receipt("k1", compute_payload_hash(b"h2"), session, agent)
        .unwrap()
    {
        SubmitOutcome::DuplicateConflict { receipt } => {
            assert_eq!(receipt.idempotency_key, "k1");
        }
        other => panic!("expected DuplicateConflict, got {other:?}"),
    }

    // The conflict is visible to operators as a duplicate audit row.
    let duplicates = kernel.queries().list_duplicate_receipts(None).unwrap();
    assert_eq!(duplicates.len(), 1);
}

/// Scenario 4: an abandoned lease is reaped to stale and the turn is
/// recoverable by a new owner.
#[test]
fn scenario_reaper_recovers_abandoned_turn() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();

    let receipt = match kernel
        .submit_receipt("k2", compute_payload_hash(b"h"), session, agent)
        .unwrap()
    {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };
    let turn_id = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();

    // Acquire with a tiny TTL, never heartbeat, let it lapse.
    let crashed = new_entity_id();
    kernel
        .acquire_lease(turn_id, crashed, Some(Duration::from_millis(1)))
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let reaper = kernel.reaper();
    assert_eq!(reaper.run_cycle(Utc::now()), 1);

    let trace = kernel.queries().get_turn_trace(turn_id).unwrap();
    assert_eq!(trace.turn.state, TurnState::Stale);
    assert_eq!(trace.turn.lease_owner_token, None);

    // A fresh owner recovers the turn and can drive it to completion.
    let recovered = new_entity_id();
    kernel.acquire_lease(turn_id, recovered, None).unwrap();
    kernel.report_executing(turn_id, recovered).unwrap();
    kernel
        .report_terminal(turn_id, recovered, TerminalOutcome::Completed, new_entity_id())
        .unwrap();
}

/// Scenario 5: two concurrent acquirers; exactly one wins, the loser gets a
/// retryable error.
#[test]
fn scenario_concurrent_acquire_single_winner() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();

    let receipt = match kernel
        .submit_receipt("k3", compute_payload_hash(b"h"), session, agent)
        .unwrap()
    {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };
    let turn_id = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let kernel = &kernel;
                scope.spawn(move || kernel.acquire_lease(turn_id, new_entity_id(), None))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 1, "exactly one acquire wins the race");
    for result in results {
        if let Err(err) = result {
            // Both a live foreign lease and a lost version swap surface as a
            // lease conflict.
            assert!(
                matches!(err, KernelError::Lease(LeaseError::Conflict { .. })),
                "loser error must be a lease conflict: {err}"
            );
            assert!(err.is_retryable(), "loser error must be retryable: {err}");
        }
    }
}

/// Handoff chains stay acyclic and stay rooted at the originating receipt.
#[test]
fn scenario_handoff_chain_is_acyclic() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();

    let receipt = match kernel
        .submit_receipt("k4", compute_payload_hash(b"h"), session, agent)
        .unwrap()
    {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };
    let first = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();

    // Drive three generations of handoffs.
    let mut current = first;
    for _ in 0..3 {
        let token = new_entity_id();
        kernel.acquire_lease(current, token, None).unwrap();
        kernel.report_executing(current, token).unwrap();
        current = kernel
            .report_handoff(current, token, new_entity_id(), EdgeType::Handoff)
            .unwrap();
    }

    // Walk outbound edges from the first turn; every hop must be new.
    let mut visited = HashSet::new();
    let mut cursor = first;
    loop {
        assert!(visited.insert(cursor), "cycle detected at turn {cursor}");
        let trace = kernel.queries().get_turn_trace(cursor).unwrap();
        assert_eq!(
            trace.turn.causation_receipt_id, receipt.receipt_id,
            "causation chain must stay rooted at the inbound receipt"
        );
        match trace.outbound_edges.first() {
            Some(edge) => cursor = edge.to_turn_id,
            None => break,
        }
    }
    assert_eq!(visited.len(), 4);
}

/// Once a terminal deliverable is recorded, no acquire ever succeeds again.
#[test]
fn scenario_terminal_turn_refuses_leases() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();

    let receipt = match kernel
        .submit_receipt("k5", compute_payload_hash(b"h"), session, agent)
        .unwrap()
    {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };
    let turn_id = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();
    let token = new_entity_id();
    kernel.acquire_lease(turn_id, token, None).unwrap();
    kernel.report_executing(turn_id, token).unwrap();
    kernel
        .report_terminal(turn_id, token, TerminalOutcome::Failed, new_entity_id())
        .unwrap();

    let err = kernel
        .acquire_lease(turn_id, new_entity_id(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        KernelError::Lease(LeaseError::TurnTerminal { .. })
    ));
}

/// Versions increase by one per committed mutation across a full lifecycle.
#[test]
fn scenario_version_monotonicity() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();

    let receipt = match kernel
        .submit_receipt("k6", compute_payload_hash(b"h"), session, agent)
        .unwrap()
    {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };
    let turn_id = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();

    let version_of = |id| kernel.queries().get_turn_trace(id).unwrap().turn.version;
    assert_eq!(version_of(turn_id), 0);

    let token = new_entity_id();
    kernel.acquire_lease(turn_id, token, None).unwrap();
    assert_eq!(version_of(turn_id), 1);
    kernel.heartbeat_lease(turn_id, token, None).unwrap();
    assert_eq!(version_of(turn_id), 2);
    kernel.report_executing(turn_id, token).unwrap();
    assert_eq!(version_of(turn_id), 3);
    kernel
        .report_terminal(turn_id, token, TerminalOutcome::Completed, new_entity_id())
        .unwrap();
    assert_eq!(version_of(turn_id), 4);
}

/// An owner that abandons work via fail() leaves the turn recoverable and the
/// annotation on record.
#[test]
fn scenario_fail_keeps_turn_recoverable() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();

    let receipt = match kernel
        .submit_receipt("k7", compute_payload_hash(b"h"), session, agent)
        .unwrap()
    {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };
    let turn_id = kernel
        .create_or_bind_turn(receipt.receipt_id, session, agent)
        .unwrap();

    let token = new_entity_id();
    kernel.acquire_lease(turn_id, token, None).unwrap();
    kernel.report_executing(turn_id, token).unwrap();
    kernel
        .fail_lease(turn_id, token, "tool sandbox crashed")
        .unwrap();

    let trace = kernel.queries().get_turn_trace(turn_id).unwrap();
    assert_eq!(trace.turn.state, TurnState::Executing);
    assert_eq!(trace.turn.lease_owner_token, None);
    assert_eq!(trace.turn.failure_annotations.len(), 1);

    // The retry resumes where the failed owner left off.
    let retry = new_entity_id();
    kernel.acquire_lease(turn_id, retry, None).unwrap();
    kernel
        .report_terminal(turn_id, retry, TerminalOutcome::Completed, new_entity_id())
        .unwrap();
}

/// The receipt trace of a stuck receipt shows no bound turn.
#[test]
fn scenario_stuck_receipt_surface() {
    let kernel = kernel();
    let session = new_entity_id();
    let agent = new_entity_id();

    let receipt = match kernel
        .submit_receipt("k8", compute_payload_hash(b"h"), session, agent)
        .unwrap()
    {
        SubmitOutcome::New { receipt } => receipt,
        other => panic!("expected New, got {other:?}"),
    };

    // Never bound; the aging report sees it immediately with a zero threshold.
    let aging = kernel
        .queries()
        .list_aging_receipts(Duration::from_secs(0))
        .unwrap();
    assert_eq!(aging.len(), 1);
    assert_eq!(aging[0].receipt_id, receipt.receipt_id);

    let trace = kernel.queries().get_receipt_trace(receipt.receipt_id).unwrap();
    assert!(trace.bound_turn.is_none());
    assert!(trace.outbound_edges.is_empty());
}

/// The aging report defaults to the configured threshold when the caller has
/// no opinion.
#[test]
fn scenario_aging_report_uses_configured_threshold() {
    use std::sync::Arc;
    use turnstile_storage::MemoryStore;
    use turnstile_test_utils::seed_receipt;

    let config = KernelConfig::development();
    let aging_threshold = config.receipt_aging_threshold;
    let store = Arc::new(MemoryStore::new());
    let kernel = Kernel::new(store.clone(), config);
    let now = Utc::now();

    let old = seed_receipt(store.as_ref(), "aged-key", |r| {
        r.first_seen_at =
            now - chrono::Duration::from_std(aging_threshold + Duration::from_secs(60)).unwrap();
    });
    seed_receipt(store.as_ref(), "fresh-key", |_| {});

    let aging = kernel.list_aging_receipts(None).unwrap();
    assert_eq!(aging.len(), 1);
    assert_eq!(aging[0].receipt_id, old.receipt_id);

    // An explicit threshold overrides the configured one.
    let all = kernel.list_aging_receipts(Some(Duration::from_secs(0))).unwrap();
    assert_eq!(all.len(), 2);
}
