//! Terminal dispatch stage of the middleware chain.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::Message;
use crate::platform::{Platform, PlatformRegistry};
use crate::result::{DeliveryResult, SendingResults};
use crate::target::{Target, group_by_platform};
use crate::{Error, Result};

/// Trait for the stage that actually hands targets to platforms.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        token: &CancellationToken,
        message: Arc<Message>,
        targets: Vec<Target>,
    ) -> Result<SendingResults>;
}

/// What to do with targets whose platform is not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPlatformPolicy {
    /// Produce a failed result for each such target.
    #[default]
    Fail,
    /// Leave such targets out of the results and log a warning.
    Skip,
}

/// Sequential dispatch stage.
///
/// Targets are grouped by platform and sent one at a time, so results keep
/// the submission order within each platform group. One failing target never
/// stops its siblings.
pub struct SequentialDispatcher {
    registry: Arc<PlatformRegistry>,
    unknown_platform: UnknownPlatformPolicy,
}

impl SequentialDispatcher {
    pub fn new(registry: Arc<PlatformRegistry>) -> Self {
        Self {
            registry,
            unknown_platform: UnknownPlatformPolicy::Fail,
        }
    }

    pub fn with_unknown_platform(mut self, policy: UnknownPlatformPolicy) -> Self {
        self.unknown_platform = policy;
        self
    }

    async fn send_group(
        &self,
        token: &CancellationToken,
        message: &Message,
        platform: &dyn Platform,
        targets: Vec<Target>,
        results: &mut SendingResults,
    ) {
        if let Err(e) = platform.validate(message) {
            warn!(platform = %platform.name(), error = %e, "Platform rejected message");
            results.extend(
                targets
                    .into_iter()
                    .map(|t| DeliveryResult::failed(&message.id, t, e.clone())),
            );
            return;
        }

        for target in targets {
            let outcome = platform
                .send(token, message, std::slice::from_ref(&target))
                .await;
            results.push(single_result(message, target, outcome));
        }
    }
}

/// Reduce a one-target platform reply to exactly one result.
fn single_result(
    message: &Message,
    target: Target,
    outcome: Result<Vec<DeliveryResult>>,
) -> DeliveryResult {
    match outcome {
        Ok(replies) => match replies.into_iter().next() {
            Some(mut result) => {
                result.message_id = message.id.clone();
                result.target = target;
                if result.is_success() && result.sent_at.is_none() {
                    result.sent_at = Some(chrono::Utc::now());
                }
                result
            }
            None => DeliveryResult::failed(
                &message.id,
                target,
                Error::transport("platform returned no result"),
            ),
        },
        Err(e) => DeliveryResult::failed(&message.id, target, e),
    }
}

/// Pre-dispatch checks shared by every orchestrator.
///
/// Assigns a message id if missing, then rejects the call before anything is
/// sent if the message is empty, no targets were given, or any target is malformed.
pub(crate) fn prepare(mut message: Message, targets: &[Target]) -> Result<Arc<Message>> {
    if message.ensure_id() {
        debug!(message_id = %message.id, "Assigned message id");
    }
    message.validate()?;
    if targets.is_empty() {
        return Err(Error::NoTargets);
    }
    for target in targets {
        target.validate()?;
    }
    Ok(Arc::new(message))
}

/// Failed results for every target of an unregistered platform.
pub(crate) fn unknown_platform_results<'a>(
    message_id: &'a str,
    platform: &'a str,
    targets: Vec<Target>,
) -> impl Iterator<Item = DeliveryResult> + 'a {
    targets.into_iter().map(move |t| {
        DeliveryResult::failed(message_id, t, Error::PlatformNotFound(platform.to_string()))
    })
}

#[async_trait]
impl Dispatcher for SequentialDispatcher {
    async fn dispatch(
        &self,
        token: &CancellationToken,
        message: Arc<Message>,
        targets: Vec<Target>,
    ) -> Result<SendingResults> {
        let mut results = SendingResults::new(&message.id);

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

            debug!(platform = %name, targets = group.len(), "Dispatching platform group");
            self.send_group(token, &message, platform.as_ref(), group, &mut results)
                .await;
        }

        Ok(results)
    }
}
