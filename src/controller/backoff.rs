//! Requeue delays for failed reconciles
//!
//! Transient failures back off exponentially with jitter so that a Checkly
//! outage does not turn into a synchronized retry storm. Attempts are counted
//! per object in memory and reset on the next success.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

use super::reconcile_loop::ObjectKey;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Exponential backoff: base * 2^attempt, capped at max
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

/// Scale a delay by a random factor in 0.5x..1.5x
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

#[derive(Clone, Copy, Debug, Default)]
struct Attempts {
    failures: u32,
    conflicts: u32,
}

/// Per-object failure counters
#[derive(Debug)]
pub struct BackoffTracker {
    base: Duration,
    max: Duration,
    attempts: Mutex<HashMap<ObjectKey, Attempts>>,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX)
    }
}

impl BackoffTracker {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn with_attempts<T>(&self, key: &ObjectKey, f: impl FnOnce(&mut Attempts) -> T) -> T {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        f(attempts.entry(key.clone()).or_default())
    }

    /// Jittered delay for the next retry of a transient failure
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let attempt = self.with_attempts(key, |a| {
            let attempt = a.failures;
            a.failures = a.failures.saturating_add(1);
            attempt
        });
        with_jitter(calculate_backoff(attempt, self.base, self.max))
    }

    /// Count a conflict; returns how many happened in a row
    pub fn record_conflict(&self, key: &ObjectKey) -> u32 {
        self.with_attempts(key, |a| {
            a.conflicts = a.conflicts.saturating_add(1);
            a.conflicts
        })
    }

    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map_or(0, |a| a.failures)
    }

    pub fn reset(&self, key: &ObjectKey) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}
