//! Bounded retries with exponential backoff and jitter

use crate::config::Config;
use crate::error::Error;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration for a single unit of work (one multipart part)
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_PART_RETRIES,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: 0.25,
        }
    }
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.part_retries,
            base_delay_ms: config.retry_delay_ms,
            max_delay_ms: config.max_retry_delay_ms,
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    /// Attempts allowed in total
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Begin tracking a fresh unit of work
    pub fn start(&self) -> Attempts<'_> {
        Attempts {
            policy: self,
            made: 0,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Wait, then try again
    Retry(Duration),
    /// Budget spent
    Exhausted,
}

/// Attempt counter for one unit of work
#[derive(Debug)]
pub struct Attempts<'a> {
    policy: &'a RetryPolicy,
    made: u32,
}

impl Attempts<'_> {
    /// Attempts made so far
    pub fn made(&self) -> u32 {
        self.made
    }

    /// Record a failed attempt and decide what follows
    pub fn failed(&mut self) -> Verdict {
        self.made += 1;
        if self.made >= self.policy.max_attempts() {
            Verdict::Exhausted
        } else {
            Verdict::Retry(calculate_delay(self.policy, self.made - 1))
        }
    }
}

/// Retry budget ran out; carries the last error
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: u32,
    pub last: Error,
}

/// Run `operation` until it succeeds or the policy's budget is spent.
///
/// Every error is retried: a part that fails for any reason gets another
/// attempt. The closure receives the 1-based attempt number.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> std::result::Result<T, Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = crate::error::Result<T>>,
{
    let mut attempts = policy.start();

    loop {
        let error = match operation(attempts.made() + 1).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        match attempts.failed() {
            Verdict::Retry(delay) => {
                tracing::warn!(
                    attempt = attempts.made(),
                    max_attempts = policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
            }
            Verdict::Exhausted => {
                return Err(Exhausted {
                    attempts: attempts.made(),
                    last: error,
                })
            }
        }
    }
}

/// Calculate delay with exponential backoff and jitter
fn calculate_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    // Exponential backoff: base * 2^retry
    let exponential = policy
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
    let capped = exponential.min(policy.max_delay_ms);

    let jitter_range = (capped as f64 * policy.jitter) as u64;
    let jitter = if jitter_range > 0 {
        rand_jitter(jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped.saturating_add(jitter))
}

/// Cheap jitter from the clock's sub-second noise
fn rand_jitter(max: u64) -> u64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % max
}
