//! Concurrent fan-out across platform groups.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatch::{Dispatcher, UnknownPlatformPolicy, prepare, unknown_platform_results};
use crate::message::Message;
use crate::platform::{HealthReport, Platform, PlatformRegistry};
use crate::result::{DeliveryResult, SendingResults};
use crate::target::{Target, TargetKey, group_by_platform};
use crate::{Error, Result};

/// Orchestrator that sends every platform group in its own task.
///
/// Each group is handed to its platform as one batch. Completed batches are
/// collected under a lock, so result order across platforms is unspecified.
/// Within a batch results follow submission order.
///
/// Unknown platforms are skipped with a warning by default. Use
/// [`Coordinator::with_unknown_platform`] to fail them instead.
pub struct Coordinator {
    registry: Arc<PlatformRegistry>,
    unknown_platform: UnknownPlatformPolicy,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(PlatformRegistry::new()))
    }

    /// Share an existing registry, e.g. with a [`crate::Hub`].
    pub fn with_registry(registry: Arc<PlatformRegistry>) -> Self {
        Self {
            registry,
            unknown_platform: UnknownPlatformPolicy::Skip,
        }
    }

    pub fn with_unknown_platform(mut self, policy: UnknownPlatformPolicy) -> Self {
        self.unknown_platform = policy;
        self
    }

    /// Register a platform. Safe to call while sends are in flight.
    pub fn register_platform(&self, platform: Arc<dyn Platform>) -> Result<()> {
        self.registry.register(platform)
    }

    pub fn registry(&self) -> &Arc<PlatformRegistry> {
        &self.registry
    }

    /// Send `message` to `targets`.
    pub async fn send(&self, message: Message, targets: Vec<Target>) -> Result<SendingResults> {
        self.send_with_cancellation(&CancellationToken::new(), message, targets)
            .await
    }

    /// Send `message` to `targets`, giving up when `token` is cancelled.
    ///
    /// On cancellation, outstanding platform tasks are aborted and the error
    /// carries the results of the groups that had already finished.
    pub async fn send_with_cancellation(
        &self,
        token: &CancellationToken,
        message: Message,
        targets: Vec<Target>,
    ) -> Result<SendingResults> {
        let message = prepare(message, &targets)?;
        self.dispatch(token, message, targets).await
    }

    pub async fn health(&self) -> HealthReport {
        self.registry.health_check_all().await
    }

    /// Close every registered platform.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Send one platform group and return exactly one result per target.
async fn send_group(
    token: &CancellationToken,
    message: &Message,
    platform: &dyn Platform,
    targets: Vec<Target>,
) -> Vec<DeliveryResult> {
    if let Err(e) = platform.validate(message) {
        warn!(platform = %platform.name(), error = %e, "Platform rejected message");
        return fail_all(&message.id, targets, e);
    }

    let outcome = AssertUnwindSafe(platform.send(token, message, &targets))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(replies)) => cover_targets(&message.id, targets, replies),
        Ok(Err(e)) => {
            warn!(platform = %platform.name(), error = %e, "Platform batch failed");
            fail_all(&message.id, targets, e)
        }
        Err(_) => {
            warn!(platform = %platform.name(), "Platform panicked during send");
            let error = Error::transport(format!("platform {} panicked", platform.name()));
            fail_all(&message.id, targets, error)
        }
    }
}

fn fail_all(message_id: &str, targets: Vec<Target>, error: Error) -> Vec<DeliveryResult> {
    targets
        .into_iter()
        .map(|t| DeliveryResult::failed(message_id, t, error.clone()))
        .collect()
}

/// Match a platform's reply against the submitted targets.
///
/// Every submitted target gets exactly one result, in submission order. A
/// target without a reply fails; replies for targets that were never
/// submitted, or surplus replies for a target, are dropped.
fn cover_targets(
    message_id: &str,
    targets: Vec<Target>,
    replies: Vec<DeliveryResult>,
) -> Vec<DeliveryResult> {
    let mut by_key: HashMap<TargetKey, VecDeque<DeliveryResult>> = HashMap::new();
    for reply in replies {
        by_key.entry(reply.target.key()).or_default().push_back(reply);
    }

    let results = targets
        .into_iter()
        .map(|target| {
            match by_key.get_mut(&target.key()).and_then(VecDeque::pop_front) {
                Some(mut reply) => {
                    reply.message_id = message_id.to_string();
                    reply.target = target;
                    reply
                }
                None => DeliveryResult::failed(
                    message_id,
                    target,
                    Error::transport("platform returned no result"),
                ),
            }
        })
        .collect();

    let unmatched: usize = by_key.values().map(VecDeque::len).sum();
    if unmatched > 0 {
        warn!(message_id = %message_id, unmatched, "Dropping replies for targets that were not sent");
    }
    results
}

#[async_trait]
impl Dispatcher for Coordinator {
    async fn dispatch(
        &self,
        token: &CancellationToken,
        message: Arc<Message>,
        targets: Vec<Target>,
    ) -> Result<SendingResults> {
        let mut results = SendingResults::new(&message.id);
        let accumulator: Arc<Mutex<Vec<DeliveryResult>>> = Arc::default();
        let mut tasks = JoinSet::new();

        for (name, group) in group_by_platform(targets) {
            let Some(platform) = self.registry.get(&name) else {
                match self.unknown_platform {
                    UnknownPlatformPolicy::Fail => {
                        warn!(platform = %name, targets = group.len(), "Transport not found");
                        results.extend(unknown_platform_results(&message.id, &name, group));
                    }
                    UnknownPlatformPolicy::Skip => {
                        warn!(platform = %name, targets = group.len(), "Skipping unknown platform");
                    }
                }
                continue;
            };

            debug!(platform = %name, targets = group.len(), "Spawning platform group");
            let token = token.clone();
            let message = message.clone();
            let accumulator = accumulator.clone();
            tasks.spawn(async move {
                let batch = send_group(&token, &message, platform.as_ref(), group).await;
                accumulator.lock().extend(batch);
            });
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => warn!(error = %e, "Platform task did not complete"),
                    None => break,
                },
                _ = token.cancelled() => {
                    tasks.abort_all();
                    results.extend(std::mem::take(&mut *accumulator.lock()));
                    warn!(
                        message_id = %message.id,
                        completed = results.total,
                        "Dispatch cancelled"
                    );
                    return Err(Error::cancelled_with(results));
                }
            }
        }

        results.extend(std::mem::take(&mut *accumulator.lock()));
        results.recount();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use super::*;

    struct SlowPlatform {
        name: String,
        latency: Duration,
        batches: AtomicU32,
        outcome: Outcome,
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Succeed,
        FailBatch,
        DropLast,
        ExtraReply,
        Panic,
    }

    impl SlowPlatform {
        fn new(name: &str, latency_ms: u64, outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                latency: Duration::from_millis(latency_ms),
                batches: AtomicU32::new(0),
                outcome,
            })
        }
    }

    #[async_trait]
    impl Platform for SlowPlatform {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(
            &self,
            _token: &CancellationToken,
            message: &Message,
            targets: &[Target],
        ) -> Result<Vec<DeliveryResult>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            let mut sent: Vec<DeliveryResult> = targets
                .iter()
                .map(|t| DeliveryResult::sent(&message.id, t.clone()))
                .collect();
            match self.outcome {
                Outcome::Succeed => Ok(sent),
                Outcome::FailBatch => Err(Error::transport("gateway down")),
                Outcome::ExtraReply => {
                    sent.push(DeliveryResult::sent(&message.id, Target::email("stranger", &self.name)));
                    Ok(sent)
                }
                Outcome::DropLast => {
                    sent.pop();
                    Ok(sent)
                }
                Outcome::Panic => panic!("platform bug"),
            }
        }
    }

    fn message() -> Message {
        Message::new("t", "b").with_id("m")
    }

    #[tokio::test]
    async fn test_groups_run_in_parallel() {
        let coordinator = Coordinator::new();
        let platforms: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|name| SlowPlatform::new(name, 100, Outcome::Succeed))
            .collect();
        for platform in &platforms {
            coordinator.register_platform(platform.clone()).unwrap();
        }

        let targets = vec![
            Target::email("1", "a"),
            Target::email("2", "b"),
            Target::email("3", "c"),
            Target::email("4", "a"),
        ];

        let start = Instant::now();
        let results = coordinator.send(message(), targets).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed < Duration::from_millis(250), "took {:?}", elapsed);
        assert_eq!(results.total, 4);
        assert_eq!(results.success, 4);
        // One batch per platform group, not per target.
        for platform in &platforms {
            assert_eq!(platform.batches.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_whole_group_failure_covers_every_target() {
        let coordinator = Coordinator::new();
        coordinator
            .register_platform(SlowPlatform::new("ok", 1, Outcome::Succeed))
            .unwrap();
        coordinator
            .register_platform(SlowPlatform::new("down", 1, Outcome::FailBatch))
            .unwrap();

        let targets = vec![
            Target::email("1", "ok"),
            Target::email("2", "down"),
            Target::email("3", "down"),
        ];
        let results = coordinator.send(message(), targets).await.unwrap();

        assert_eq!(results.total, 3);
        assert_eq!(results.success, 1);
        assert_eq!(results.failed, 2);
        for failure in results.failures() {
            assert_eq!(failure.target.platform, "down");
            assert!(failure.error.as_ref().unwrap().to_string().contains("gateway down"));
        }
    }

    #[tokio::test]
    async fn test_short_reply_and_panic_are_padded() {
        let coordinator = Coordinator::new();
        coordinator
            .register_platform(SlowPlatform::new("lossy", 1, Outcome::DropLast))
            .unwrap();
        coordinator
            .register_platform(SlowPlatform::new("buggy", 1, Outcome::Panic))
            .unwrap();

        let targets = vec![
            Target::email("1", "lossy"),
            Target::email("2", "lossy"),
            Target::email("3", "buggy"),
        ];
        let results = coordinator.send(message(), targets).await.unwrap();

        assert_eq!(results.total, 3);
        assert_eq!(results.success, 1);
        let failed: Vec<&str> = {
            let mut v: Vec<&str> = results.failures().map(|r| r.target.value.as_str()).collect();
            v.sort_unstable();
            v
        };
        assert_eq!(failed, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_extra_replies_do_not_inflate_totals() {
        let coordinator = Coordinator::new();
        coordinator
            .register_platform(SlowPlatform::new("A", 1, Outcome::ExtraReply))
            .unwrap();

        let results = coordinator
            .send(message(), vec![Target::email("1", "A")])
            .await
            .unwrap();

        assert_eq!(results.total, 1);
        assert_eq!(results.success, 1);
        assert_eq!(results.results[0].target.value, "1");
    }

    #[tokio::test]
    async fn test_unknown_platform_skip_and_fail() {
        let registry = Arc::new(PlatformRegistry::new());
        registry
            .register(SlowPlatform::new("a", 1, Outcome::Succeed))
            .unwrap();
        let targets = vec![Target::email("1", "a"), Target::email("2", "ghost")];

        let skipping = Coordinator::with_registry(registry.clone());
        let results = skipping.send(message(), targets.clone()).await.unwrap();
        assert_eq!(results.total, 1);

        let failing =
            Coordinator::with_registry(registry).with_unknown_platform(UnknownPlatformPolicy::Fail);
        let results = failing.send(message(), targets).await.unwrap();
        assert_eq!(results.total, 2);
        assert_eq!(results.failed, 1);
    }

    #[tokio::test]
    async fn test_cancellation_returns_partial_results() {
        let coordinator = Coordinator::new();
        coordinator
            .register_platform(SlowPlatform::new("fast", 1, Outcome::Succeed))
            .unwrap();
        coordinator
            .register_platform(SlowPlatform::new("stuck", 10_000, Outcome::Succeed))
            .unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = coordinator
            .send_with_cancellation(
                &token,
                message(),
                vec![Target::email("1", "fast"), Target::email("2", "stuck")],
            )
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(2));
        let partial = err.partial_results().unwrap();
        assert_eq!(partial.total, 1);
        assert_eq!(partial.results[0].target.value, "1");
    }

    #[tokio::test]
    async fn test_validation_happens_before_dispatch() {
        let coordinator = Coordinator::new();
        let platform = SlowPlatform::new("a", 1, Outcome::Succeed);
        coordinator.register_platform(platform.clone()).unwrap();

        let err = coordinator
            .send(message(), vec![Target::email("1", "a"), Target::new("", "2", "a")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget { .. }));
        assert_eq!(platform.batches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cover_targets_drops_unsolicited_replies() {
        let targets = vec![Target::email("x", "p"), Target::email("y", "p")];
        let replies = vec![
            DeliveryResult::sent("m", Target::email("stranger", "p")),
            DeliveryResult::sent("m", Target::email("y", "p")),
            DeliveryResult::sent("m", Target::email("y", "p")),
        ];
        let results = cover_targets("m", targets, replies);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].target.value, "x");
        assert!(results[0].is_failed());
        assert_eq!(results[1].target.value, "y");
        assert!(results[1].is_success());
    }

    #[test]
    fn test_cover_targets_handles_duplicates() {
        let targets = vec![Target::email("x", "p"), Target::email("x", "p")];
        let replies = vec![DeliveryResult::sent("other", Target::email("x", "p"))];
        let results = cover_targets("m", targets, replies);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.message_id == "m"));
        assert_eq!(results.iter().filter(|r| r.is_failed()).count(), 1);
    }
}
