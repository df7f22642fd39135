//! TURNSTILE Kernel - Turn Coordination
//!
//! The kernel decides whether advancing a unit of agent work is currently
//! permitted and whether an inbound event has already been processed. It does
//! not execute tools or models; collaborators report what happened and the
//! kernel records it durably, exactly once per idempotency key.
//!
//! # Components
//!
//! - [`ReceiptLedger`]: records and deduplicates inbound deliveries
//! - [`TurnStateMachine`]: validates and commits lifecycle transitions
//! - [`LeaseManager`]: TTL-bounded exclusive ownership of turns
//! - [`Reaper`]: reclaims turns whose lease lapsed without a terminal outcome
//! - [`QuerySurface`]: read-only operational views
//!
//! All mutation flows through per-record compare-and-swap in the store; the
//! kernel itself is synchronous request/response. Only the optional
//! [`reaper_task`] background loop is async.

pub mod lease;
pub mod ledger;
pub mod machine;
pub mod query;
pub mod reaper;

pub use lease::LeaseManager;
pub use ledger::{ReceiptLedger, SubmitOutcome};
pub use machine::TurnStateMachine;
pub use query::{QuerySurface, ReceiptTrace, TurnTrace};
pub use reaper::{reaper_task, Reaper, ReaperMetrics, ReaperSnapshot};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use turnstile_core::{
    AgentId, DeliverableId, EdgeType, Granted, InboxReceipt, KernelConfig, KernelResult, Lease,
    OwnerToken, PayloadHash, ReceiptId, SessionId, TerminalOutcome, TurnId,
};
use turnstile_storage::{MemoryStore, TurnStoreTrait};

/// Facade wiring the kernel components over a shared store.
///
/// Collaborators drive the full control flow through this type: submit a
/// receipt, bind it to a turn, acquire the lease, report progress, and commit
/// a terminal outcome. Each method delegates to the owning component.
pub struct Kernel {
    config: KernelConfig,
    lease: LeaseManager,
    ledger: ReceiptLedger,
    machine: TurnStateMachine,
    query: QuerySurface,
    store: Arc<dyn TurnStoreTrait>,
}

impl Kernel {
    pub fn new(store: Arc<dyn TurnStoreTrait>, config: KernelConfig) -> Self {
        let ledger = ReceiptLedger::new(store.clone());
        Self {
            lease: LeaseManager::new(store.clone()),
            machine: TurnStateMachine::new(store.clone(), ledger.clone()),
            query: QuerySurface::new(store.clone()),
            ledger,
            config,
            store,
        }
    }

    /// Kernel backed by the in-memory reference store.
    pub fn in_memory(config: KernelConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Build a reaper sharing this kernel's store and config. Run it on a
    /// schedule via [`reaper_task`] or on demand via [`Reaper::run_cycle`].
    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.store.clone(), self.ledger.clone(), self.config.clone())
    }

    // === Ingress ===

    /// Record an inbound delivery attempt. See [`ReceiptLedger::submit`].
    pub fn submit_receipt(
        &self,
        idempotency_key: &str,
        payload_hash: PayloadHash,
        session_id: SessionId,
        agent_id: AgentId,
    ) -> KernelResult<SubmitOutcome> {
        self.ledger
            .submit(idempotency_key, payload_hash, session_id, agent_id)
    }

    /// Create a turn for a pending receipt, or resolve to the turn it already
    /// bound. See [`TurnStateMachine::create_or_bind_turn`].
    pub fn create_or_bind_turn(
        &self,
        receipt_id: ReceiptId,
        session_id: SessionId,
        agent_id: AgentId,
    ) -> KernelResult<TurnId> {
        self.machine
            .create_or_bind_turn(receipt_id, session_id, agent_id)
    }

    // === Leases ===

    /// Acquire an exclusive lease; `ttl` defaults to the configured lease TTL.
    pub fn acquire_lease(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        ttl: Option<Duration>,
    ) -> KernelResult<Lease<Granted>> {
        self.lease
            .acquire(turn_id, owner_token, ttl.unwrap_or(self.config.lease_ttl))
    }

    /// Extend a held lease; `extend_by` defaults to the configured extension.
    pub fn heartbeat_lease(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        extend_by: Option<Duration>,
    ) -> KernelResult<Lease<Granted>> {
        self.lease.heartbeat(
            turn_id,
            owner_token,
            extend_by.unwrap_or(self.config.heartbeat_extension),
        )
    }

    /// Release a held lease. Idempotent.
    pub fn release_lease(&self, turn_id: TurnId, owner_token: OwnerToken) -> KernelResult<()> {
        self.lease.release(turn_id, owner_token)
    }

    /// Release the lease and record a failure annotation; the turn stays
    /// acquirable.
    pub fn fail_lease(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        reason: impl Into<String>,
    ) -> KernelResult<()> {
        self.lease.fail(turn_id, owner_token, reason)
    }

    // === Progress reports ===

    pub fn report_executing(&self, turn_id: TurnId, owner_token: OwnerToken) -> KernelResult<()> {
        self.machine.report_executing(turn_id, owner_token)
    }

    pub fn report_approval_wait(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
    ) -> KernelResult<()> {
        self.machine.report_approval_wait(turn_id, owner_token)
    }

    pub fn report_terminal(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        outcome: TerminalOutcome,
        deliverable_id: DeliverableId,
    ) -> KernelResult<()> {
        self.machine
            .report_terminal(turn_id, owner_token, outcome, deliverable_id)
    }

    pub fn report_handoff(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        next_agent_id: AgentId,
        edge_type: EdgeType,
    ) -> KernelResult<TurnId> {
        self.machine
            .report_handoff(turn_id, owner_token, next_agent_id, edge_type)
    }

    // === Queries ===

    pub fn queries(&self) -> &QuerySurface {
        &self.query
    }

    /// Receipts pending longer than `threshold`; defaults to the configured
    /// aging threshold.
    pub fn list_aging_receipts(
        &self,
        threshold: Option<Duration>,
    ) -> KernelResult<Vec<InboxReceipt>> {
        self.query
            .list_aging_receipts(threshold.unwrap_or(self.config.receipt_aging_threshold))
    }

    /// Run one reap cycle now. Convenience for callers that reap on demand
    /// before concluding an acquire conflict is permanent.
    pub fn run_reap_cycle(&self) -> u64 {
        self.reaper().run_cycle(Utc::now())
    }
}
