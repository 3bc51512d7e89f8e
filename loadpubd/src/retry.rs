//! Retry and wait-for-visibility primitives used by session workers.
//!
//! Both run on the session's own thread and block it while sleeping; the
//! sleep function is injectable so tests can record delays instead.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use loadpub_common::config::RetryConfig;
use tracing::{debug, warn};

/// Blocking sleep used between attempts and polls.
pub type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Sleep on the current thread.
pub fn thread_sleep() -> SleepFn {
    Arc::new(std::thread::sleep)
}

/// Linear backoff retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * base_delay` before the next one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Every attempt failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// No sleep follows the final failed attempt.
pub fn run_with_retry<T, E, F>(
    operation: &str,
    policy: &RetryPolicy,
    sleep: &dyn Fn(Duration),
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    E: Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Attempt succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                sleep(delay);
                attempt += 1;
            }
            Err(err) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }
        }
    }
}

/// Poll `predicate` every `interval` until it holds.
///
/// Returns `Ok(false)` once `limit` polls came back false; with no limit it
/// waits indefinitely. Predicate errors end the wait immediately.
pub fn wait_until<E, F>(
    interval: Duration,
    limit: Option<u32>,
    sleep: &dyn Fn(Duration),
    mut predicate: F,
) -> Result<bool, E>
where
    F: FnMut() -> Result<bool, E>,
{
    let mut polls: u32 = 0;
    loop {
        if predicate()? {
            return Ok(true);
        }
        polls = polls.saturating_add(1);
        if limit.is_some_and(|limit| polls >= limit) {
            return Ok(false);
        }
        sleep(interval);
    }
}
