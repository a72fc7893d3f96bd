//! Per-identity retry backoff

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;

use crate::store::ObjectKey;

/// Exponential backoff: `initial * 2^attempt`, capped at `max`, with up to
/// `jitter` of the delay added at random. A delay that would pass the cap is
/// drawn below it instead, so retries at the cap stay spread out.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        let jittered = base.mul_f64(1.0 + extra);
        if jittered <= self.max {
            jittered
        } else {
            self.max.mul_f64(1.0 - extra)
        }
    }
}

/// Attempt counters keyed by ObjectStore identity
#[derive(Debug)]
pub struct RetryTracker {
    backoff: Backoff,
    attempts: Mutex<HashMap<ObjectKey, u32>>,
}

impl RetryTracker {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for the next retry of `key`, counting this failure
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = attempts.entry(key.clone()).or_insert(0);
        let delay = self.backoff.delay(*attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Forget the failures of `key` after it converged
    pub fn reset(&self, key: &ObjectKey) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drop the counters of identities `keep` rejects, such as ObjectStores
    /// deleted before they ever converged
    pub fn retain(&self, mut keep: impl FnMut(&ObjectKey) -> bool) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| keep(key));
    }

    /// Number of tracked identities
    pub fn len(&self) -> usize {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consecutive failures recorded for `key`
    pub fn attempts(&self, key: &ObjectKey) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}
