//! Exponential backoff with jitter and the retriable-error classifier
//! (spec.md 4.5).

use std::time::Duration;

use rand::Rng;
use tokio::time;
use tracing::warn;

use crate::error::UpstreamError;

/// Substrings that mark an error as non-retriable regardless of how it's
/// classified otherwise; checked first.
const NON_RETRIABLE_KEYWORDS: &[&str] = &[
    "invalid",
    "not found",
    "unauthorized",
    "forbidden",
    "bad request",
    "validation",
    "parse error",
];

/// Substrings that mark an error as retriable.
const RETRIABLE_KEYWORDS: &[&str] = &[
    "timeout",
    "econnrefused",
    "econnreset",
    "etimedout",
    "network",
    "temporary",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retriable,
    NonRetriable,
}

/// Classify an upstream error by keyword match on its lowercased message.
/// Unmatched messages default to retriable (spec.md 4.5): a transient
/// failure mode we haven't named yet is more likely than a permanent one.
pub fn classify(error: &UpstreamError) -> Classification {
    if error.is_terminal() {
        return Classification::NonRetriable;
    }

    let message = error.classifier_message();
    if NON_RETRIABLE_KEYWORDS.iter().any(|kw| message.contains(kw)) {
        return Classification::NonRetriable;
    }
    if RETRIABLE_KEYWORDS.iter().any(|kw| message.contains(kw)) {
        return Classification::Retriable;
    }
    Classification::Retriable
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Delay before the given attempt (1-indexed retry number), doubling
    /// each time and capped at `max_delay`, plus up to 10% jitter so that
    /// concurrent callers retrying the same failure don't all wake at once.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled = self
            .initial_delay
            .as_millis()
            .saturating_mul(1u128 << exponent.min(32));
        let capped = scaled.min(self.max_delay.as_millis());
        let base_ms = capped as u64;

        let jitter_ms = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=(base_ms / 10).max(1))
        };

        Duration::from_millis(base_ms + jitter_ms)
    }
}

/// Run `op` up to `policy.max_attempts` times, retrying only on
/// [`Classification::Retriable`] failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let classification = classify(&err);
                if classification == Classification::NonRetriable || attempt >= policy.max_attempts
                {
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after upstream error"
                );
                time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
