//! Lease typestate for compile-time safety of lease lifecycle.
//!
//! A lease is not a separate durable entity: it is the field pair
//! (`lease_owner_token`, `lease_expires_at`) on an [`AgentTurn`](crate::AgentTurn),
//! guarded by the turn's `version`. This module models the in-memory
//! capability a caller holds after a successful acquire.
//!
//! # State Transition Diagram
//!
//! ```text
//! (unleased) ─── acquire() ──→ Granted ─── release() ──→ (unleased)
//!                                 │
//!                            extend() ↺
//! ```

use crate::{OwnerToken, Timestamp, TurnId};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;

// ============================================================================
// LEASE DATA (state-independent)
// ============================================================================

/// The durable portion of a lease, as stored on the turn record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LeaseData {
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub turn_id: TurnId,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "uuid"))]
    pub owner_token: OwnerToken,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub granted_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub expires_at: Timestamp,
}

impl LeaseData {
    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            let duration = self.expires_at - now;
            duration.to_std().ok()
        }
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lease states.
pub trait LeaseState: private::Sealed + Send + Sync {}

/// Lease is currently held by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Granted;
impl LeaseState for Granted {}

/// Lease has been released (for documentation; leases in this state don't exist at runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LeaseState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Granted {}
    impl Sealed for super::Released {}
}

// ============================================================================
// LEASE TYPESTATE WRAPPER
// ============================================================================

/// A lease with compile-time state tracking.
///
/// The type parameter `S` indicates the current state of the lease.
/// Only `Lease<Granted>` can be extended or released; transitions consume
/// the lease so a released capability cannot be reused.
#[derive(Debug, Clone)]
pub struct Lease<S: LeaseState> {
    data: LeaseData,
    _state: PhantomData<S>,
}

impl<S: LeaseState> Lease<S> {
    /// Access the underlying lease data (read-only).
    pub fn data(&self) -> &LeaseData {
        &self.data
    }

    /// Get the turn this lease guards.
    pub fn turn_id(&self) -> TurnId {
        self.data.turn_id
    }

    /// Get the holder's token.
    pub fn owner_token(&self) -> OwnerToken {
        self.data.owner_token
    }

    /// Get when the lease was granted.
    pub fn granted_at(&self) -> Timestamp {
        self.data.granted_at
    }

    /// Get when the lease expires.
    pub fn expires_at(&self) -> Timestamp {
        self.data.expires_at
    }
}

impl Lease<Granted> {
    /// Create a granted lease from data.
    ///
    /// This should only be called when a lease is successfully acquired or
    /// heartbeated.
    pub fn new(data: LeaseData) -> Self {
        Lease {
            data,
            _state: PhantomData,
        }
    }

    /// Extend the lease expiry.
    ///
    /// Returns a new `Lease<Granted>` with the updated expiry time.
    /// The original lease is consumed.
    pub fn extend(mut self, additional: Duration) -> Self {
        let additional_chrono = chrono::Duration::from_std(additional)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(additional.as_millis() as i64));
        self.data.expires_at = self.data.expires_at + additional_chrono;
        self
    }

    /// Release the lease and return the underlying data.
    ///
    /// Consumes the lease, preventing further operations.
    pub fn release(self) -> LeaseData {
        self.data
    }

    /// Check if the lease has expired.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }

    /// Get remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        self.data.remaining_duration(now)
    }
}
