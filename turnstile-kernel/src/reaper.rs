//! Stale-turn reaper background task.
//!
//! Reclaims turns whose lease expired without a terminal transition and marks
//! receipts that sat pending past the ingress threshold. Runs on a schedule or
//! on demand (a caller may run a cycle before concluding an acquire conflict
//! is permanent).
//!
//! Correctness rule: the scan result is only a candidate list. Before acting
//! the reaper re-reads each turn fresh and skips any lease heartbeated past
//! `now`, so a live owner is never reaped under clock or scheduling skew.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use turnstile_core::{
    validate_transition, KernelConfig, KernelError, StorageError, Timestamp, TurnState,
};
use turnstile_storage::{LeasePatch, TurnStoreTrait, TurnUpdate};

use crate::ledger::ReceiptLedger;

// ============================================================================
// METRICS
// ============================================================================

/// Counters tracking reaper activity since startup.
#[derive(Debug, Default)]
pub struct ReaperMetrics {
    /// Turns transitioned to stale
    pub turns_reaped: AtomicU64,

    /// Receipts marked stuck
    pub receipts_marked_stuck: AtomicU64,

    /// Cycles completed
    pub reap_cycles: AtomicU64,

    /// Errors encountered while reaping
    pub reap_errors: AtomicU64,
}

impl ReaperMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> ReaperSnapshot {
        ReaperSnapshot {
            turns_reaped: self.turns_reaped.load(Ordering::Relaxed),
            receipts_marked_stuck: self.receipts_marked_stuck.load(Ordering::Relaxed),
            reap_cycles: self.reap_cycles.load(Ordering::Relaxed),
            reap_errors: self.reap_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reaper counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperSnapshot {
    pub turns_reaped: u64,
    pub receipts_marked_stuck: u64,
    pub reap_cycles: u64,
    pub reap_errors: u64,
}

// ============================================================================
// REAPER
// ============================================================================

/// Scans for expired leases and pending-too-long receipts.
pub struct Reaper {
    store: Arc<dyn TurnStoreTrait>,
    ledger: ReceiptLedger,
    config: KernelConfig,
    metrics: Arc<ReaperMetrics>,
}

impl Reaper {
    pub fn new(store: Arc<dyn TurnStoreTrait>, ledger: ReceiptLedger, config: KernelConfig) -> Self {
        Self {
            store,
            ledger,
            config,
            metrics: Arc::new(ReaperMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<ReaperMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one reap cycle at `now`. Returns the number of turns reaped.
    pub fn run_cycle(&self, now: Timestamp) -> u64 {
        self.metrics.reap_cycles.fetch_add(1, Ordering::Relaxed);

        let reaped = self.reap_expired_turns(now);
        let stuck = self.mark_stuck_receipts(now);

        if reaped > 0 || stuck > 0 {
            tracing::info!(turns_reaped = reaped, receipts_stuck = stuck, "reap cycle completed");
        } else {
            tracing::trace!("reap cycle completed with nothing to reclaim");
        }
        reaped
    }

    fn reap_expired_turns(&self, now: Timestamp) -> u64 {
        let candidates = match self.store.turn_list_lease_expired(now) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(error = %e, "failed to scan for expired leases");
                self.metrics.reap_errors.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };

        let mut reaped = 0u64;

        for candidate in candidates.into_iter().take(self.config.reap_batch_size) {
            // Re-read fresh: the scan may be stale relative to a heartbeat.
            let turn = match self.store.turn_get(candidate.turn_id) {
                Ok(Some(turn)) => turn,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, turn_id = %candidate.turn_id, "failed to re-read turn");
                    self.metrics.reap_errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            if turn.is_terminal() || turn.state == TurnState::Stale {
                continue;
            }
            if turn.has_live_lease(now) || turn.lease_expires_at.is_none() {
                // Heartbeated past now, or released in the meantime.
                continue;
            }
            if validate_transition(turn.state, TurnState::Stale).is_err() {
                continue;
            }

            match self.store.turn_cas_update(
                turn.turn_id,
                turn.version,
                TurnUpdate {
                    state: Some(TurnState::Stale),
                    lease: Some(LeasePatch::Clear),
                    ..Default::default()
                },
            ) {
                Ok(_) => {
                    tracing::warn!(
                        turn_id = %turn.turn_id,
                        previous_state = %turn.state,
                        lease_expired_at = ?turn.lease_expires_at,
                        "stale turn reclaimed"
                    );
                    reaped += 1;
                    self.metrics.turns_reaped.fetch_add(1, Ordering::Relaxed);
                }
                Err(KernelError::Storage(StorageError::VersionConflict { .. })) => {
                    // Somebody advanced the turn between read and swap.
                    tracing::debug!(turn_id = %turn.turn_id, "turn already updated, skipping");
                }
                Err(e) => {
                    tracing::error!(error = %e, turn_id = %turn.turn_id, "failed to reap turn");
                    self.metrics.reap_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        reaped
    }

    fn mark_stuck_receipts(&self, now: Timestamp) -> u64 {
        let threshold = chrono::Duration::from_std(self.config.receipt_stuck_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));
        let cutoff = now - threshold;

        let pending = match self.store.receipt_list_pending_older_than(cutoff) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "failed to scan for aged pending receipts");
                self.metrics.reap_errors.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };

        let mut stuck = 0u64;
        for receipt in pending {
            match self.ledger.mark_stuck(receipt.receipt_id) {
                Ok(()) => {
                    stuck += 1;
                    self.metrics
                        .receipts_marked_stuck
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(KernelError::Storage(StorageError::StatusConflict { .. }))
                | Err(KernelError::Ledger(turnstile_core::LedgerError::NotPending { .. })) => {
                    // Bound (or already stuck) between scan and swap.
                    tracing::debug!(receipt_id = %receipt.receipt_id, "receipt already updated, skipping");
                }
                Err(e) => {
                    tracing::error!(error = %e, receipt_id = %receipt.receipt_id, "failed to mark receipt stuck");
                    self.metrics.reap_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        stuck
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that periodically runs reap cycles.
///
/// Runs until the shutdown signal flips to `true`. Returns the metrics
/// collected during the task's lifetime.
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// let handle = tokio::spawn(reaper_task(reaper, shutdown_rx));
/// // later
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn reaper_task(
    reaper: Reaper,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ReaperMetrics> {
    let mut check_interval = interval(reaper.config.reaper_check_interval);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = reaper.config.reaper_check_interval.as_secs(),
        stuck_threshold_secs = reaper.config.receipt_stuck_threshold.as_secs(),
        "reaper task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("reaper task shutting down");
                    break;
                }
            }

            _ = check_interval.tick() => {
                reaper.run_cycle(Utc::now());
            }
        }
    }

    let snapshot = reaper.metrics.snapshot();
    tracing::info!(
        turns_reaped = snapshot.turns_reaped,
        receipts_marked_stuck = snapshot.receipts_marked_stuck,
        reap_cycles = snapshot.reap_cycles,
        reap_errors = snapshot.reap_errors,
        "reaper task completed"
    );

    reaper.metrics()
}
