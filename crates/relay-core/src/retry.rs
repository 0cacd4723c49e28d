//! Retry policy: bounded local retry of rate-limited processor calls.

use std::time::Duration;

use tracing::warn;

use crate::domain::{Payload, ProcessingError};
use crate::ports::{CognitiveProcessor, ConversationHandle};

/// Retry policy for rate-limited processor calls.
///
/// Exponential backoff: `delay = base_delay * multiplier^(attempts - 1)`,
/// capped at `max_delay`.
///
/// Example with base_delay=500ms, multiplier=2.0:
/// - after attempt 1: 500ms
/// - after attempt 2: 1s
/// - (attempt 3 is the last with the default `max_attempts = 3`)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total calls including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `attempts` is the number of attempts already made (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        // overflow to infinity (or NaN) saturates at the cap
        Duration::try_from_secs_f64(delay_secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Calls `processor`, retrying `RateLimited` failures per `policy`.
///
/// Any other failure, or a rate limit on the last allowed attempt, is
/// returned as is.
pub async fn invoke_with_retry(
    processor: &dyn CognitiveProcessor,
    policy: &RetryPolicy,
    instructions: &str,
    input: &Payload,
    context: Option<&ConversationHandle>,
) -> Result<String, ProcessingError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match processor.invoke(instructions, input, context).await {
            Err(ProcessingError::RateLimited { message, retry_after })
                if attempts < policy.max_attempts =>
            {
                let delay = retry_after
                    .unwrap_or_else(|| policy.next_delay(attempts))
                    .min(policy.max_delay);
                warn!(
                    attempts,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "processor rate limited, backing off: {message}"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::FnProcessor;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.multiplier, 2.0);
    }

    #[test]
    fn exponential_backoff_increases_and_caps() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(3),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
        assert_eq!(policy.next_delay(2), Duration::from_secs(1));
        assert_eq!(policy.next_delay(3), Duration::from_secs(2));
        assert_eq!(policy.next_delay(4), Duration::from_secs(3));
        assert_eq!(policy.next_delay(10), Duration::from_secs(3));
    }

    #[test]
    fn huge_attempt_counts_saturate_at_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 5000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.next_delay(1100), policy.max_delay);
        assert_eq!(policy.next_delay(u32::MAX), policy.max_delay);

        let nan = RetryPolicy {
            multiplier: f64::NAN,
            ..RetryPolicy::default()
        };
        assert_eq!(nan.next_delay(2), nan.max_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_calls_are_retried_until_success() {
        let remaining = AtomicU32::new(2);
        let processor = FnProcessor::new(move |_, _| {
            if remaining.load(Ordering::SeqCst) > 0 {
                remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(ProcessingError::rate_limited("429"));
            }
            Ok("done".to_string())
        });

        let out = invoke_with_retry(&processor, &RetryPolicy::default(), "", &Payload::new(), None)
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(processor.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_gives_up_after_max_attempts() {
        let processor = FnProcessor::new(|_, _| Err(ProcessingError::rate_limited("429")));

        let err = invoke_with_retry(&processor, &RetryPolicy::default(), "", &Payload::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::RateLimited { .. }));
        assert_eq!(processor.calls(), 3);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let processor =
            FnProcessor::new(|_, _| Err(ProcessingError::InvalidInput("bad".to_string())));

        let err = invoke_with_retry(&processor, &RetryPolicy::default(), "", &Payload::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)));
        assert_eq!(processor.calls(), 1);
    }
}
