//! Per-platform token-bucket admission control.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Middleware, Next};
use crate::config::RateLimitConfig;
use crate::message::Message;
use crate::result::{DeliveryResult, SendingResults};
use crate::target::{Target, TargetKey, group_by_platform};
use crate::{Error, Result};

/// Token bucket refilled lazily on access.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: refill_per_sec.max(0.0),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refilling.
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

/// Rejects targets whose platform has run out of tokens.
///
/// Admission is decided per target. Platforms without a configured bucket
/// pass through untouched. Rejected targets get an immediate `rate limited`
/// result and never reach the platform.
#[derive(Debug, Default)]
pub struct RateLimitMiddleware {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimitMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(limits: &HashMap<String, RateLimitConfig>) -> Self {
        let middleware = Self::new();
        for (platform, limit) in limits {
            middleware.set_limit(platform, limit.capacity, limit.refill_per_sec);
        }
        middleware
    }

    pub fn with_limit(self, platform: impl Into<String>, capacity: u32, refill_per_sec: f64) -> Self {
        self.set_limit(platform, capacity, refill_per_sec);
        self
    }

    /// Install or replace the bucket for `platform`. A replaced bucket starts full.
    pub fn set_limit(&self, platform: impl Into<String>, capacity: u32, refill_per_sec: f64) {
        self.buckets.write().insert(
            platform.into(),
            Arc::new(Mutex::new(TokenBucket::new(capacity, refill_per_sec))),
        );
    }

    pub fn remove_limit(&self, platform: &str) -> bool {
        self.buckets.write().remove(platform).is_some()
    }

    fn bucket(&self, platform: &str) -> Option<Arc<Mutex<TokenBucket>>> {
        self.buckets.read().get(platform).cloned()
    }

    /// Split targets into admitted targets and immediate rejections.
    fn admit(&self, message_id: &str, targets: Vec<Target>) -> (Vec<Target>, Vec<DeliveryResult>) {
        let mut admitted = Vec::with_capacity(targets.len());
        let mut rejected = Vec::new();

        for (platform, group) in group_by_platform(targets) {
            let Some(bucket) = self.bucket(&platform) else {
                admitted.extend(group);
                continue;
            };

            let mut bucket = bucket.lock();
            for target in group {
                if bucket.try_acquire() {
                    admitted.push(target);
                } else {
                    debug!(platform = %platform, recipient = %target.value, "Target rate limited");
                    rejected.push(DeliveryResult::failed(message_id, target, Error::RateLimited));
                }
            }
        }

        (admitted, rejected)
    }
}

/// Submission positions of each target, keyed by identity.
fn submission_positions(targets: &[Target]) -> HashMap<TargetKey, VecDeque<usize>> {
    let mut positions: HashMap<TargetKey, VecDeque<usize>> = HashMap::new();
    for (i, target) in targets.iter().enumerate() {
        positions.entry(target.key()).or_default().push_back(i);
    }
    positions
}

/// Stable-sort results back into submission order. Results for targets that
/// were never submitted go last.
fn restore_submission_order(
    results: &mut Vec<DeliveryResult>,
    mut positions: HashMap<TargetKey, VecDeque<usize>>,
) {
    let mut ordered: Vec<(usize, DeliveryResult)> = results
        .drain(..)
        .map(|r| {
            let position = positions
                .get_mut(&r.target.key())
                .and_then(VecDeque::pop_front)
                .unwrap_or(usize::MAX);
            (position, r)
        })
        .collect();
    ordered.sort_by_key(|(position, _)| *position);
    results.extend(ordered.into_iter().map(|(_, r)| r));
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn process(
        &self,
        token: &CancellationToken,
        message: Arc<Message>,
        targets: Vec<Target>,
        next: Next<'_>,
    ) -> Result<SendingResults> {
        let positions = submission_positions(&targets);
        let (admitted, rejected) = self.admit(&message.id, targets);

        if !rejected.is_empty() {
            warn!(
                message_id = %message.id,
                admitted = admitted.len(),
                rejected = rejected.len(),
                "Rate limit rejected targets"
            );
        }

        let mut results = if admitted.is_empty() {
            SendingResults::new(&message.id)
        } else {
            next.run(token, message.clone(), admitted).await?
        };
        if !rejected.is_empty() {
            results.results.extend(rejected);
            restore_submission_order(&mut results.results, positions);
            results.recount();
        }
        Ok(results)
    }
}
