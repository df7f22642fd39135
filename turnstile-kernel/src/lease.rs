//! Lease manager: exclusive, TTL-bounded ownership of a turn.
//!
//! Ownership lives on the turn record itself (`lease_owner_token`,
//! `lease_expires_at`) and every grant, extension, release, and failure note
//! goes through compare-and-swap on the turn's `version`. TTL-based leases
//! bound the blast radius of a crashed executor; a lease that is never
//! heartbeated simply lapses and the reaper makes the turn recoverable.
//!
//! `acquire` never blocks: on conflict it returns immediately and the caller
//! owns retry/backoff policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use turnstile_core::{
    AgentTurn, FailureAnnotation, Granted, KernelError, KernelResult, Lease, LeaseData, LeaseError,
    OwnerToken, StorageError, Timestamp, TurnId, TurnState,
};
use turnstile_storage::{LeasePatch, TurnStoreTrait, TurnUpdate};

/// Grants, extends, and revokes exclusive ownership of turns.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn TurnStoreTrait>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn TurnStoreTrait>) -> Self {
        Self { store }
    }

    /// Acquire an exclusive lease on a turn.
    ///
    /// Succeeds only if no lease exists or the existing lease has expired.
    /// Re-acquiring one's own live lease extends it. Acquiring a `Created` or
    /// `Stale` turn also moves it to `Leased` in the same swap, so no observer
    /// ever sees a live lease on a stale turn.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::Conflict`] when another live lease exists, or when a
    ///   concurrent acquirer wins the version swap; retryable either way
    /// - [`LeaseError::TurnTerminal`] when the turn already terminated
    pub fn acquire(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        ttl: Duration,
    ) -> KernelResult<Lease<Granted>> {
        let turn = self.load(turn_id)?;
        let now = Utc::now();

        if turn.is_terminal() || turn.terminal_deliverable_id.is_some() {
            return Err(LeaseError::TurnTerminal {
                turn_id,
                state: turn.state,
            }
            .into());
        }

        if turn.has_live_lease(now) {
            match turn.lease_owner_token {
                Some(holder) if holder == owner_token => {
                    // Re-acquire by the current holder extends the lease.
                }
                Some(holder) => {
                    tracing::debug!(
                        turn_id = %turn_id,
                        holder = %holder,
                        requester = %owner_token,
                        "lease acquire refused: live foreign lease"
                    );
                    return Err(LeaseError::Conflict {
                        turn_id,
                        holder,
                        expires_at: turn.lease_expires_at.unwrap_or(now),
                    }
                    .into());
                }
                None => {}
            }
        }

        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(ttl.as_millis() as i64));

        // Created and Stale turns become Leased in the same swap. Turns whose
        // prior owner lapsed mid-flight keep their state; the new owner decides
        // whether to resume or terminate.
        let state = match turn.state {
            TurnState::Created | TurnState::Stale => Some(TurnState::Leased),
            _ => None,
        };

        let updated = match self.store.turn_cas_update(
            turn_id,
            turn.version,
            TurnUpdate {
                state,
                lease: Some(LeasePatch::Grant {
                    owner_token,
                    expires_at,
                }),
                ..Default::default()
            },
        ) {
            Ok(updated) => updated,
            Err(KernelError::Storage(StorageError::VersionConflict { .. })) => {
                // Lost the swap to a concurrent writer; report it in lease
                // terms with whatever the record now holds.
                let fresh = self.load(turn_id)?;
                return Err(LeaseError::Conflict {
                    turn_id,
                    holder: fresh.lease_owner_token.unwrap_or(owner_token),
                    expires_at: fresh.lease_expires_at.unwrap_or(now),
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(
            turn_id = %turn_id,
            owner = %owner_token,
            expires_at = %expires_at,
            version = updated.version,
            "lease granted"
        );

        Ok(Lease::new(LeaseData {
            turn_id,
            owner_token,
            granted_at: now,
            expires_at,
        }))
    }

    /// Extend a held lease before it lapses.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NotOwned`] when the token does not match the current
    /// holder or the lease already expired; the caller must re-acquire.
    pub fn heartbeat(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        extend_by: Duration,
    ) -> KernelResult<Lease<Granted>> {
        let turn = self.load(turn_id)?;
        let now = Utc::now();

        if !turn.is_lease_holder(owner_token, now) {
            return Err(LeaseError::NotOwned {
                turn_id,
                token: owner_token,
            }
            .into());
        }

        // is_lease_holder guarantees the expiry is present.
        let current_expiry = turn.lease_expires_at.unwrap_or(now);
        let expires_at = current_expiry
            + chrono::Duration::from_std(extend_by).unwrap_or_else(|_| {
                chrono::Duration::milliseconds(extend_by.as_millis() as i64)
            });

        self.store.turn_cas_update(
            turn_id,
            turn.version,
            TurnUpdate {
                lease: Some(LeasePatch::Grant {
                    owner_token,
                    expires_at,
                }),
                ..Default::default()
            },
        )?;

        Ok(Lease::new(LeaseData {
            turn_id,
            owner_token,
            granted_at: now,
            expires_at,
        }))
    }

    /// Release a lease. Idempotent: releasing an already-released (or
    /// already-expired) lease is a no-op success. Releasing a live lease held
    /// by somebody else is [`LeaseError::NotOwned`].
    pub fn release(&self, turn_id: TurnId, owner_token: OwnerToken) -> KernelResult<()> {
        let turn = self.load(turn_id)?;
        let now = Utc::now();

        match turn.lease_owner_token {
            None => Ok(()),
            Some(holder) if holder != owner_token => {
                if turn.has_live_lease(now) {
                    Err(LeaseError::NotOwned {
                        turn_id,
                        token: owner_token,
                    }
                    .into())
                } else {
                    // The foreign lease already lapsed; nothing to release.
                    Ok(())
                }
            }
            Some(_) => {
                self.store.turn_cas_update(
                    turn_id,
                    turn.version,
                    TurnUpdate {
                        lease: Some(LeasePatch::Clear),
                        ..Default::default()
                    },
                )?;
                tracing::debug!(turn_id = %turn_id, owner = %owner_token, "lease released");
                Ok(())
            }
        }
    }

    /// Release the lease and record a failure annotation without advancing
    /// state, leaving the turn acquirable by a subsequent owner.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NotOwned`] when the token never held the lease.
    pub fn fail(
        &self,
        turn_id: TurnId,
        owner_token: OwnerToken,
        reason: impl Into<String>,
    ) -> KernelResult<()> {
        let turn = self.load(turn_id)?;

        if turn.lease_owner_token != Some(owner_token) {
            return Err(LeaseError::NotOwned {
                turn_id,
                token: owner_token,
            }
            .into());
        }

        let reason = reason.into();
        self.store.turn_cas_update(
            turn_id,
            turn.version,
            TurnUpdate {
                lease: Some(LeasePatch::Clear),
                push_failure_annotation: Some(FailureAnnotation {
                    owner_token,
                    reason: reason.clone(),
                    recorded_at: Utc::now(),
                }),
                ..Default::default()
            },
        )?;

        tracing::info!(
            turn_id = %turn_id,
            owner = %owner_token,
            reason = %reason,
            "lease failed by owner; turn stays recoverable"
        );
        Ok(())
    }

    fn load(&self, turn_id: TurnId) -> KernelResult<AgentTurn> {
        self.store.turn_get(turn_id)?.ok_or_else(|| {
            StorageError::NotFound {
                entity_type: turnstile_core::EntityType::Turn,
                id: turn_id,
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_core::{new_entity_id, KernelError};
    use turnstile_storage::MemoryStore;
    use turnstile_test_utils::seed_turn;

    fn manager_with_turn() -> (LeaseManager, Arc<MemoryStore>, TurnId) {
        let store = Arc::new(MemoryStore::new());
        let turn = seed_turn(store.as_ref(), TurnState::Created);
        (LeaseManager::new(store.clone()), store, turn.turn_id)
    }

    #[test]
    fn test_acquire_fresh_turn_moves_to_leased() {
        let (manager, store, turn_id) = manager_with_turn();
        let token = new_entity_id();

        let lease = manager
            .acquire(turn_id, token, Duration::from_secs(30))
            .unwrap();
        assert_eq!(lease.owner_token(), token);

        let stored = store.turn_get(turn_id).unwrap().unwrap();
        assert_eq!(stored.state, TurnState::Leased);
        assert_eq!(stored.lease_owner_token, Some(token));
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_second_acquirer_conflicts() {
        let (manager, _store, turn_id) = manager_with_turn();
        manager
            .acquire(turn_id, new_entity_id(), Duration::from_secs(30))
            .unwrap();

        let err = manager
            .acquire(turn_id, new_entity_id(), Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, KernelError::Lease(LeaseError::Conflict { .. })));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_holder_reacquire_extends() {
        let (manager, store, turn_id) = manager_with_turn();
        let token = new_entity_id();
        let first = manager
            .acquire(turn_id, token, Duration::from_secs(5))
            .unwrap();
        let second = manager
            .acquire(turn_id, token, Duration::from_secs(60))
            .unwrap();
        assert!(second.expires_at() > first.expires_at());

        let stored = store.turn_get(turn_id).unwrap().unwrap();
        assert_eq!(stored.lease_owner_token, Some(token));
    }

    #[test]
    fn test_acquire_over_expired_lease_succeeds() {
        let (manager, _store, turn_id) = manager_with_turn();
        manager
            .acquire(turn_id, new_entity_id(), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let new_owner = new_entity_id();
        let lease = manager
            .acquire(turn_id, new_owner, Duration::from_secs(30))
            .unwrap();
        assert_eq!(lease.owner_token(), new_owner);
    }

    #[test]
    fn test_acquire_terminal_turn_refused() {
        let store = Arc::new(MemoryStore::new());
        let turn = seed_turn(store.as_ref(), TurnState::Completed);
        let manager = LeaseManager::new(store);

        let err = manager
            .acquire(turn.turn_id, new_entity_id(), Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Lease(LeaseError::TurnTerminal { .. })
        ));
    }

    #[test]
    fn test_heartbeat_extends_only_for_holder() {
        let (manager, _store, turn_id) = manager_with_turn();
        let token = new_entity_id();
        let lease = manager
            .acquire(turn_id, token, Duration::from_secs(30))
            .unwrap();

        let extended = manager
            .heartbeat(turn_id, token, Duration::from_secs(30))
            .unwrap();
        assert!(extended.expires_at() > lease.expires_at());

        let err = manager
            .heartbeat(turn_id, new_entity_id(), Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, KernelError::Lease(LeaseError::NotOwned { .. })));
    }

    #[test]
    fn test_heartbeat_after_expiry_fails() {
        let (manager, _store, turn_id) = manager_with_turn();
        let token = new_entity_id();
        manager
            .acquire(turn_id, token, Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let err = manager
            .heartbeat(turn_id, token, Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, KernelError::Lease(LeaseError::NotOwned { .. })));
    }

    #[test]
    fn test_release_is_idempotent() {
        let (manager, store, turn_id) = manager_with_turn();
        let token = new_entity_id();
        manager
            .acquire(turn_id, token, Duration::from_secs(30))
            .unwrap();

        manager.release(turn_id, token).unwrap();
        manager.release(turn_id, token).unwrap();

        let stored = store.turn_get(turn_id).unwrap().unwrap();
        assert_eq!(stored.lease_owner_token, None);
    }

    #[test]
    fn test_release_foreign_live_lease_refused() {
        let (manager, _store, turn_id) = manager_with_turn();
        manager
            .acquire(turn_id, new_entity_id(), Duration::from_secs(30))
            .unwrap();

        let err = manager.release(turn_id, new_entity_id()).unwrap_err();
        assert!(matches!(err, KernelError::Lease(LeaseError::NotOwned { .. })));
    }

    #[test]
    fn test_fail_records_annotation_and_frees_turn() {
        let (manager, store, turn_id) = manager_with_turn();
        let token = new_entity_id();
        manager
            .acquire(turn_id, token, Duration::from_secs(30))
            .unwrap();

        manager.fail(turn_id, token, "model timeout").unwrap();

        let stored = store.turn_get(turn_id).unwrap().unwrap();
        assert_eq!(stored.lease_owner_token, None);
        assert_eq!(stored.failure_annotations.len(), 1);
        assert_eq!(stored.failure_annotations[0].reason, "model timeout");
        assert_eq!(stored.state, TurnState::Leased);

        // A subsequent acquirer can retry the same turn.
        manager
            .acquire(turn_id, new_entity_id(), Duration::from_secs(30))
            .unwrap();
    }
}
