//! Kernel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_LEASE_TTL_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_EXTENSION_SECS: u64 = 30;
const DEFAULT_REAPER_CHECK_INTERVAL_SECS: u64 = 10;
const DEFAULT_RECEIPT_AGING_THRESHOLD_SECS: u64 = 300;
const DEFAULT_RECEIPT_STUCK_THRESHOLD_SECS: u64 = 1800;
const DEFAULT_REAP_BATCH_SIZE: usize = 100;

/// Configuration for the coordination kernel.
///
/// Durations are wall-clock policy knobs; nothing in the kernel caches them
/// against the records they govern (the reaper always re-reads lease expiry
/// fresh before acting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Lease lifetime granted by `acquire` when the caller has no opinion
    #[serde(with = "duration_secs")]
    pub lease_ttl: Duration,

    /// Extension applied by `heartbeat` when the caller has no opinion
    #[serde(with = "duration_secs")]
    pub heartbeat_extension: Duration,

    /// How often the reaper scans for expired leases
    #[serde(with = "duration_secs")]
    pub reaper_check_interval: Duration,

    /// Pending receipts older than this show up in the aging report
    #[serde(with = "duration_secs")]
    pub receipt_aging_threshold: Duration,

    /// Pending receipts older than this are marked stuck by the reaper
    #[serde(with = "duration_secs")]
    pub receipt_stuck_threshold: Duration,

    /// Maximum turns reaped per cycle
    pub reap_batch_size: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            heartbeat_extension: Duration::from_secs(DEFAULT_HEARTBEAT_EXTENSION_SECS),
            reaper_check_interval: Duration::from_secs(DEFAULT_REAPER_CHECK_INTERVAL_SECS),
            receipt_aging_threshold: Duration::from_secs(DEFAULT_RECEIPT_AGING_THRESHOLD_SECS),
            receipt_stuck_threshold: Duration::from_secs(DEFAULT_RECEIPT_STUCK_THRESHOLD_SECS),
            reap_batch_size: DEFAULT_REAP_BATCH_SIZE,
        }
    }
}

impl KernelConfig {
    /// Create a KernelConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TURNSTILE_LEASE_TTL_SECS`: default lease lifetime (default: 30)
    /// - `TURNSTILE_HEARTBEAT_EXTENSION_SECS`: default heartbeat extension (default: 30)
    /// - `TURNSTILE_REAPER_CHECK_INTERVAL_SECS`: reaper scan interval (default: 10)
    /// - `TURNSTILE_RECEIPT_AGING_THRESHOLD_SECS`: aging report threshold (default: 300)
    /// - `TURNSTILE_RECEIPT_STUCK_THRESHOLD_SECS`: stuck-marking threshold (default: 1800)
    /// - `TURNSTILE_REAP_BATCH_SIZE`: max turns reaped per cycle (default: 100)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            lease_ttl: env_secs("TURNSTILE_LEASE_TTL_SECS").unwrap_or(defaults.lease_ttl),
            heartbeat_extension: env_secs("TURNSTILE_HEARTBEAT_EXTENSION_SECS")
                .unwrap_or(defaults.heartbeat_extension),
            reaper_check_interval: env_secs("TURNSTILE_REAPER_CHECK_INTERVAL_SECS")
                .unwrap_or(defaults.reaper_check_interval),
            receipt_aging_threshold: env_secs("TURNSTILE_RECEIPT_AGING_THRESHOLD_SECS")
                .unwrap_or(defaults.receipt_aging_threshold),
            receipt_stuck_threshold: env_secs("TURNSTILE_RECEIPT_STUCK_THRESHOLD_SECS")
                .unwrap_or(defaults.receipt_stuck_threshold),
            reap_batch_size: std::env::var("TURNSTILE_REAP_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.reap_batch_size),
        }
    }

    /// Configuration for development/testing with short timeouts.
    pub fn development() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            heartbeat_extension: Duration::from_secs(5),
            reaper_check_interval: Duration::from_secs(1),
            receipt_aging_threshold: Duration::from_secs(10),
            receipt_stuck_threshold: Duration::from_secs(60),
            reap_batch_size: 10,
        }
    }

    /// Configuration for production with conservative thresholds.
    pub fn production() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            heartbeat_extension: Duration::from_secs(60),
            reaper_check_interval: Duration::from_secs(30),
            receipt_aging_threshold: Duration::from_secs(600),
            receipt_stuck_threshold: Duration::from_secs(3600),
            reap_batch_size: DEFAULT_REAP_BATCH_SIZE,
        }
    }
}

fn env_secs(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
