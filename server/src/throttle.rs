//! Brute-force protection for the login path.
//!
//! The [`AttemptThrottle`] counts failed logins per identity and locks the
//! identity for a fixed window once the failure threshold is reached.
//!
//! # Algorithm
//!
//! - Each failure increments the identity's counter.
//! - When the counter reaches [`MAX_FAILED_ATTEMPTS`], the identity is locked
//!   for [`LOCKOUT_MINUTES`] minutes from that failure.
//! - A successful login removes the record entirely.
//! - Expired locks are treated as unlocked on the next check; there is no
//!   background sweep, so a stale counter survives until the next success or
//!   failure.
//!
//! # Example
//!
//! ```rust
//! use courier_server::throttle::AttemptThrottle;
//!
//! let throttle = AttemptThrottle::default();
//! for _ in 0..5 {
//!     throttle.record_failure("alice");
//! }
//! assert!(throttle.is_locked("alice"));
//!
//! throttle.record_success("alice");
//! assert!(!throttle.is_locked("alice"));
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

/// Failures that trigger a lock.
pub const MAX_FAILED_ATTEMPTS: u32 = 5;

/// Length of a lock, in minutes.
pub const LOCKOUT_MINUTES: i64 = 15;

/// Failure history for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttemptRecord {
    pub failure_count: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

/// Result of a lock check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Login attempts may proceed.
    Open,

    /// The identity is locked.
    Locked {
        /// Seconds until the lock expires, rounded up.
        retry_after_secs: u64,
    },
}

impl LockStatus {
    #[inline]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    #[inline]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Open => None,
            Self::Locked { retry_after_secs } => Some(*retry_after_secs),
        }
    }
}

/// Thread-safe per-identity failure counter with time-boxed lockout.
///
/// Records live in a sharded concurrent map, so updates for one identity
/// are atomic without serializing unrelated identities. Cloning shares the
/// underlying state.
#[derive(Debug, Clone)]
pub struct AttemptThrottle {
    records: Arc<DashMap<String, AttemptRecord>>,
    max_failures: u32,
    lockout: Duration,
}

impl Default for AttemptThrottle {
    fn default() -> Self {
        Self::new(MAX_FAILED_ATTEMPTS, Duration::minutes(LOCKOUT_MINUTES))
    }
}

impl AttemptThrottle {
    /// Creates a throttle that locks after `max_failures` for `lockout`.
    pub fn new(max_failures: u32, lockout: Duration) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            max_failures: max_failures.max(1),
            lockout,
        }
    }

    /// Records a failed login for `identity` at the current time.
    pub fn record_failure(&self, identity: &str) -> AttemptRecord {
        self.record_failure_at(identity, Utc::now())
    }

    /// Records a failed login for `identity` at `now`.
    ///
    /// Returns the updated record.
    pub fn record_failure_at(&self, identity: &str, now: DateTime<Utc>) -> AttemptRecord {
        let mut entry = self.records.entry(identity.to_string()).or_default();
        let record = entry.value_mut();

        record.failure_count = record.failure_count.saturating_add(1);
        if record.failure_count >= self.max_failures {
            record.locked_until = Some(now + self.lockout);
            warn!(
                failure_count = record.failure_count,
                lockout_secs = self.lockout.num_seconds(),
                "Identity locked after repeated login failures"
            );
        } else {
            debug!(failure_count = record.failure_count, "Recorded login failure");
        }

        *record
    }

    /// Clears all failure history for `identity`.
    pub fn record_success(&self, identity: &str) {
        self.records.remove(identity);
    }

    /// Returns `true` if `identity` is locked at the current time.
    pub fn is_locked(&self, identity: &str) -> bool {
        self.status_at(identity, Utc::now()).is_locked()
    }

    /// Returns `true` if `identity` is locked at `now`.
    pub fn is_locked_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        self.status_at(identity, now).is_locked()
    }

    /// Returns the lock status of `identity` at the current time.
    pub fn status(&self, identity: &str) -> LockStatus {
        self.status_at(identity, Utc::now())
    }

    /// Returns the lock status of `identity` at `now`.
    pub fn status_at(&self, identity: &str, now: DateTime<Utc>) -> LockStatus {
        let Some(record) = self.records.get(identity) else {
            return LockStatus::Open;
        };

        match record.locked_until {
            Some(until) if record.is_locked_at(now) => {
                let remaining_ms = (until - now).num_milliseconds().max(0) as u64;
                LockStatus::Locked {
                    retry_after_secs: remaining_ms.div_ceil(1000).max(1),
                }
            }
            _ => LockStatus::Open,
        }
    }

    /// Returns a copy of the record for `identity`, if any.
    pub fn record(&self, identity: &str) -> Option<AttemptRecord> {
        self.records.get(identity).map(|r| *r)
    }

    /// Number of identities with failure history.
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}
