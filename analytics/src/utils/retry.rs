//! Bounded retry for store bring-up.
//!
//! Keyspace selection, column-family discovery and the TTL system-object
//! read all run against a store that may still be coming up. Each step
//! retries under a [`RetryPolicy`]; callers fall back to degraded-mode
//! defaults once the attempts are spent.

use std::thread::sleep;
use std::time::Duration;

/// How often and how patiently a bring-up step is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            interval: Duration::from_secs(5),
        }
    }
}

/// Runs `op` until it succeeds or the policy's attempts are spent, sleeping
/// the policy interval between attempts (not after the last one). Returns
/// the first success or the error of the final attempt.
pub fn retry<F, T, E>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if attempt < attempts {
                    sleep(policy.interval);
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt runs"))
}
