//! Requeue policy for failed deliveries
//!
//! Failed deliveries are always retried. With a fixed retry interval
//! configured every retry waits exactly that long; otherwise the delay grows
//! exponentially per object. Objects that keep failing are escalated in logs
//! and in their result record, but never given up on.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

/// Consecutive failures after which a Service is escalated
pub const ESCALATION_THRESHOLD: u32 = 10;

/// Base delay for exponential backoff (seconds)
const BASE_DELAY_SECS: u64 = 5;

/// Maximum delay between retries (5 minutes)
const MAX_DELAY_SECS: u64 = 300;

/// Consecutive failed deliveries per object UID
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure and return the new count
    pub fn increment(&self, uid: &str) -> u32 {
        let mut attempts = self.lock();
        let count = attempts.entry(uid.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget the object's failures (successful delivery, or the object is gone)
    pub fn reset(&self, uid: &str) {
        self.lock().remove(uid);
    }

    pub fn get(&self, uid: &str) -> u32 {
        self.lock().get(uid).copied().unwrap_or(0)
    }

    /// Drop entries for objects that no longer exist, returning how many went
    pub fn cleanup(&self, active_uids: &HashSet<String>) -> usize {
        let mut attempts = self.lock();
        let before = attempts.len();
        attempts.retain(|uid, _| active_uids.contains(uid));
        before - attempts.len()
    }
}

/// Error classification, used for log levels and event reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network, timeout, 5xx and conflicting writes
    Transient,
    /// The open-api refused a request; likely needs an operator
    Rejected,
}

/// Delay before redelivering an object after its `attempt`-th consecutive failure
pub fn retry_delay(attempt: u32, fixed: Option<Duration>) -> Duration {
    if let Some(fixed) = fixed {
        return fixed;
    }

    // 5s, 10s, 20s, ... capped at 5 minutes
    let exponent = attempt.saturating_sub(1).min(16);
    let delay_secs = BASE_DELAY_SECS
        .saturating_mul(2u64.pow(exponent))
        .min(MAX_DELAY_SECS);
    debug!(attempt, delay_secs, "Scheduling retry with exponential backoff");
    Duration::from_secs(delay_secs)
}

pub fn is_escalated(attempt: u32) -> bool {
    attempt >= ESCALATION_THRESHOLD
}
