//! Per-target retry with pluggable backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Middleware, Next};
use crate::config::{BackoffKind, RetryConfig};
use crate::error::ErrorKind;
use crate::message::Message;
use crate::result::{DeliveryResult, SendingResults};
use crate::target::{Target, TargetKey};
use crate::{Error, Result};

/// Custom backoff: maps a 1-based retry attempt and base delay to a wait.
pub type BackoffFn = Arc<dyn Fn(u32, Duration) -> Duration + Send + Sync>;

/// `base * 2^(attempt - 1)`, saturating instead of overflowing.
pub fn exponential_backoff(attempt: u32, base: Duration) -> Duration {
    let multiplier = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.checked_mul(multiplier).unwrap_or(Duration::MAX)
}

/// Exponential backoff plus up to 25% random jitter.
pub fn exponential_backoff_with_jitter(attempt: u32, base: Duration) -> Duration {
    let delay = exponential_backoff(attempt, base);
    let jitter_range_ms = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    if jitter_range_ms == 0 {
        return delay;
    }
    let jitter_ms = rand::rng().random_range(0..=jitter_range_ms);
    delay.saturating_add(Duration::from_millis(jitter_ms))
}

/// `base * attempt`.
pub fn linear_backoff(attempt: u32, base: Duration) -> Duration {
    base.checked_mul(attempt.max(1)).unwrap_or(Duration::MAX)
}

/// Always `base`.
pub fn constant_backoff(_attempt: u32, base: Duration) -> Duration {
    base
}

/// Backoff strategy used between retry rounds.
#[derive(Clone)]
pub enum Backoff {
    Exponential,
    ExponentialJitter,
    Linear,
    Constant,
    Custom(BackoffFn),
}

impl Backoff {
    pub fn delay(&self, attempt: u32, base: Duration) -> Duration {
        match self {
            Self::Exponential => exponential_backoff(attempt, base),
            Self::ExponentialJitter => exponential_backoff_with_jitter(attempt, base),
            Self::Linear => linear_backoff(attempt, base),
            Self::Constant => constant_backoff(attempt, base),
            Self::Custom(f) => f(attempt, base),
        }
    }
}

impl From<BackoffKind> for Backoff {
    fn from(kind: BackoffKind) -> Self {
        match kind {
            BackoffKind::Exponential => Self::Exponential,
            BackoffKind::ExponentialJitter => Self::ExponentialJitter,
            BackoffKind::Linear => Self::Linear,
            BackoffKind::Constant => Self::Constant,
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exponential => write!(f, "Exponential"),
            Self::ExponentialJitter => write!(f, "ExponentialJitter"),
            Self::Linear => write!(f, "Linear"),
            Self::Constant => write!(f, "Constant"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Error kinds that are never retried unless overridden.
pub const DEFAULT_NON_RETRYABLE: &[ErrorKind] = &[
    ErrorKind::InvalidCredentials,
    ErrorKind::InvalidTargetType,
    ErrorKind::EmptyTargetValue,
    ErrorKind::InvalidMessage,
    ErrorKind::PlatformNotFound,
    ErrorKind::Cancelled,
];

/// Retries failed targets, and only those, until they succeed or run out of attempts.
///
/// Results keep their identity across rounds: a retried target's original
/// record is updated in place and its `attempts` counter bumped per round.
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff: Backoff,
    non_retryable: HashSet<ErrorKind>,
}

impl RetryMiddleware {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
            backoff: Backoff::ExponentialJitter,
            non_retryable: DEFAULT_NON_RETRYABLE.iter().copied().collect(),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let mut middleware = Self::new(
            config.max_retries,
            Duration::from_millis(config.initial_delay_ms),
        )
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_backoff(config.backoff.into());
        if let Some(kinds) = &config.non_retryable {
            middleware = middleware.with_non_retryable(kinds.iter().copied());
        }
        middleware
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the set of error kinds that are never retried.
    pub fn with_non_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.non_retryable = kinds.into_iter().collect();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wait before retry round `attempt` (1-based), capped at the max delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff
            .delay(attempt, self.base_delay)
            .min(self.max_delay)
    }

    pub fn is_retryable_error(&self, error: &Error) -> bool {
        !self.non_retryable.contains(&error.kind())
    }

    fn should_retry(&self, result: &DeliveryResult) -> bool {
        result.is_failed()
            && result.attempts < self.max_retries
            && result
                .error
                .as_ref()
                .is_none_or(|e| self.is_retryable_error(e))
    }
}

/// Group replies by target identity, keeping their order per target.
fn index_replies(replies: Vec<DeliveryResult>) -> HashMap<TargetKey, VecDeque<DeliveryResult>> {
    let mut by_key: HashMap<TargetKey, VecDeque<DeliveryResult>> = HashMap::new();
    for reply in replies {
        by_key.entry(reply.target.key()).or_default().push_back(reply);
    }
    by_key
}

/// Fold the outcome of a retry round back into the original record.
fn reconcile(original: &mut DeliveryResult, reply: Option<DeliveryResult>) {
    match reply {
        Some(reply) if reply.is_success() => original.mark_sent(reply.response, reply.sent_at),
        Some(reply) => original.mark_failed(
            reply
                .error
                .unwrap_or_else(|| Error::transport(format!("target ended as {}", reply.status))),
        ),
        None => original.mark_failed(Error::transport("no result returned for retried target")),
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn process(
        &self,
        token: &CancellationToken,
        message: Arc<Message>,
        targets: Vec<Target>,
        next: Next<'_>,
    ) -> Result<SendingResults> {
        let mut results = next.run(token, message.clone(), targets).await?;

        let mut pending: Vec<usize> = (0..results.results.len())
            .filter(|&i| self.should_retry(&results.results[i]))
            .collect();

        for attempt in 1..=self.max_retries {
            if pending.is_empty() {
                break;
            }

            let delay = self.delay_for_attempt(attempt);
            warn!(
                message_id = %message.id,
                attempt,
                max = self.max_retries,
                pending = pending.len(),
                delay_ms = delay.as_millis() as u64,
                "Retrying failed targets"
            );

            tokio::select! {
                _ = token.cancelled() => {
                    results.recount();
                    return Err(Error::cancelled_with(results));
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let mut retry_targets = Vec::with_capacity(pending.len());
            for &i in &pending {
                let original = &mut results.results[i];
                original.mark_retrying();
                retry_targets.push(original.target.clone());
            }

            let retried = match next.run(token, message.clone(), retry_targets).await {
                Ok(retried) => retried,
                Err(Error::Cancelled { partial }) => {
                    let mut replies = index_replies(partial.map(|p| p.results).unwrap_or_default());
                    for &i in &pending {
                        let original = &mut results.results[i];
                        match replies
                            .get_mut(&original.target.key())
                            .and_then(VecDeque::pop_front)
                        {
                            Some(reply) => reconcile(original, Some(reply)),
                            None => original.mark_failed(Error::cancelled()),
                        }
                    }
                    results.recount();
                    warn!(message_id = %message.id, attempt, "Retry round cancelled");
                    return Err(Error::cancelled_with(results));
                }
                Err(e) => return Err(e),
            };

            let mut replies = index_replies(retried.results);

            let mut still_failing = Vec::new();
            for i in pending {
                let original = &mut results.results[i];
                let reply = replies
                    .get_mut(&original.target.key())
                    .and_then(VecDeque::pop_front);
                reconcile(original, reply);

                if self.should_retry(original) {
                    still_failing.push(i);
                } else if original.is_failed() {
                    debug!(
                        recipient = %original.target,
                        attempts = original.attempts,
                        "Giving up on target"
                    );
                }
            }
            pending = still_failing;
        }

        results.recount();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_monotonic() {
        let base = Duration::from_millis(100);
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let delay = exponential_backoff(attempt, base);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            previous = delay;
        }
        assert_eq!(exponential_backoff(1, base), base);
        assert_eq!(exponential_backoff(3, base), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let delay = exponential_backoff_with_jitter(2, base);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let base = Duration::from_millis(50);
        assert_eq!(linear_backoff(3, base), Duration::from_millis(150));
        assert_eq!(constant_backoff(7, base), base);
    }

    #[test]
    fn test_delay_is_capped() {
        let retry = RetryMiddleware::new(10, Duration::from_secs(1))
            .with_backoff(Backoff::Exponential)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(8), Duration::from_secs(5));
    }

    #[test]
    fn test_custom_backoff() {
        let retry = RetryMiddleware::new(3, Duration::from_millis(10)).with_backoff(
            Backoff::Custom(Arc::new(|attempt, base| base * (attempt * 10))),
        );
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
    }

    #[test]
    fn test_retryability() {
        let retry = RetryMiddleware::new(2, Duration::from_millis(1));
        assert!(retry.is_retryable_error(&Error::transport("timeout")));
        assert!(!retry.is_retryable_error(&Error::InvalidCredentials("bad key".into())));
        assert!(!retry.is_retryable_error(&Error::EmptyTargetValue));

        let mut result = DeliveryResult::failed("m", Target::email("a", "p"), Error::transport("x"));
        assert!(retry.should_retry(&result));
        result.attempts = 2;
        assert!(!retry.should_retry(&result));

        let sent = DeliveryResult::sent("m", Target::email("a", "p"));
        assert!(!retry.should_retry(&sent));
    }

    struct CancelOnRetry {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl crate::dispatch::Dispatcher for CancelOnRetry {
        async fn dispatch(
            &self,
            _token: &CancellationToken,
            message: Arc<Message>,
            targets: Vec<Target>,
        ) -> Result<SendingResults> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut results = SendingResults::new(&message.id);
            if call > 0 {
                return Err(Error::cancelled_with(results));
            }
            results.extend(targets.into_iter().map(|t| {
                if t.value == "a" {
                    DeliveryResult::sent(&message.id, t)
                } else {
                    DeliveryResult::failed(&message.id, t, Error::transport("flaky"))
                }
            }));
            Ok(results)
        }
    }

    #[tokio::test]
    async fn test_cancelled_round_keeps_earlier_results() {
        let dispatcher = CancelOnRetry {
            calls: std::sync::atomic::AtomicU32::new(0),
        };
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(
            RetryMiddleware::new(2, Duration::from_millis(1)).with_backoff(Backoff::Constant),
        )];

        let err = Next::new(&chain, &dispatcher)
            .run(
                &CancellationToken::new(),
                Arc::new(Message::new("t", "b").with_id("m")),
                vec![Target::email("a", "p"), Target::email("b", "p")],
            )
            .await
            .unwrap_err();

        let partial = err.partial_results().unwrap();
        assert_eq!(partial.total, 2);
        assert_eq!(partial.success, 1);
        assert!(partial.results[0].is_success());
        let cancelled = &partial.results[1];
        assert!(cancelled.is_failed());
        assert_eq!(cancelled.error.as_ref().unwrap().kind(), ErrorKind::Cancelled);
        assert_eq!(cancelled.attempts, 1);
    }

    #[test]
    fn test_reconcile_updates_in_place() {
        let mut original = DeliveryResult::failed("m", Target::email("a", "p"), Error::transport("x"));
        original.mark_retrying();

        let reply = DeliveryResult::sent("m", Target::email("a", "p"))
            .with_response(serde_json::json!({"id": 42}));
        reconcile(&mut original, Some(reply));
        assert!(original.is_success());
        assert_eq!(original.attempts, 1);
        assert_eq!(original.response.as_ref().unwrap()["id"], 42);

        let mut missing = DeliveryResult::failed("m", Target::email("b", "p"), Error::transport("x"));
        reconcile(&mut missing, None);
        assert!(missing.is_failed());
    }
}
