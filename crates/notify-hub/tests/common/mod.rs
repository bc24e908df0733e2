//! Shared test platform.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use notify_hub::{DeliveryResult, Error, Message, Platform, Result, Target};
use tokio_util::sync::CancellationToken;

/// Scriptable in-memory platform.
pub struct MockPlatform {
    name: String,
    latency: Duration,
    check_delay: Duration,
    fail_first: u32,
    hang_from: Option<u32>,
    error: Option<Error>,
    stray: Option<Target>,
    calls: AtomicU32,
    delivered: AtomicU32,
    closes: AtomicU32,
}

impl MockPlatform {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            latency: Duration::ZERO,
            check_delay: Duration::ZERO,
            fail_first: 0,
            hang_from: None,
            error: None,
            stray: None,
            calls: AtomicU32::new(0),
            delivered: AtomicU32::new(0),
            closes: AtomicU32::new(0),
        }
    }

    /// Fail every target of the first `n` send calls with a transport error.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Fail every target of every call with `error`.
    pub fn always_failing(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }

    /// Never return from call number `call` onwards.
    pub fn hanging_from(mut self, call: u32) -> Self {
        self.hang_from = Some(call);
        self
    }

    /// Add `extra` to every reply, a result for a target that was never sent.
    pub fn with_stray_reply(mut self, extra: Target) -> Self {
        self.stray = Some(extra);
        self
    }

    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency = Duration::from_millis(ms);
        self
    }

    pub fn with_check_delay(mut self, ms: u64) -> Self {
        self.check_delay = Duration::from_millis(ms);
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of `send` invocations.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of targets delivered successfully.
    pub fn delivered(&self) -> u32 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        _token: &CancellationToken,
        message: &Message,
        targets: &[Target],
    ) -> Result<Vec<DeliveryResult>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.hang_from.is_some_and(|from| call >= from) {
            std::future::pending::<()>().await;
        }

        let failure = match &self.error {
            Some(e) => Some(e.clone()),
            None if call <= self.fail_first => {
                Some(Error::transport(format!("{} unavailable (call {})", self.name, call)))
            }
            None => None,
        };

        let mut results: Vec<DeliveryResult> = targets
            .iter()
            .map(|t| match &failure {
                Some(e) => DeliveryResult::failed(&message.id, t.clone(), e.clone()),
                None => {
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                    DeliveryResult::sent(&message.id, t.clone())
                }
            })
            .collect();
        if let Some(extra) = &self.stray {
            results.push(DeliveryResult::sent(&message.id, extra.clone()));
        }
        Ok(results)
    }

    async fn health_check(&self) -> Result<()> {
        if !self.check_delay.is_zero() {
            tokio::time::sleep(self.check_delay).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn message() -> Message {
    Message::new("Deploy finished", "v2.3.1 is live")
}

pub fn fast_retry(max_retries: u32) -> notify_hub::RetryConfig {
    notify_hub::RetryConfig {
        max_retries,
        initial_delay_ms: 1,
        max_delay_ms: 10,
        backoff: notify_hub::BackoffKind::Constant,
        non_retryable: None,
    }
}
