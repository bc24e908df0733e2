//! Hub: the canonical orchestrator.
//!
//! The hub validates a send request, runs it through the registered
//! middleware chain and hands what survives to the dispatch stage selected
//! by [`DispatchMode`].

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;
use crate::config::{DispatchMode, HubConfig};
use crate::coordinator::Coordinator;
use crate::dispatch::{Dispatcher, SequentialDispatcher, prepare};
use crate::lifecycle::LifecycleManager;
use crate::message::Message;
use crate::middleware::{Middleware, Next, RateLimitMiddleware, RetryMiddleware};
use crate::platform::{HealthReport, Platform, PlatformRegistry};
use crate::result::SendingResults;
use crate::target::Target;

/// Notification hub.
///
/// Platforms and middleware are meant to be registered before concurrent
/// sends begin. A send takes a snapshot of the chain, so a middleware added
/// mid-flight only affects later sends.
pub struct Hub {
    registry: Arc<PlatformRegistry>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    dispatcher: Arc<dyn Dispatcher>,
    lifecycle: LifecycleManager,
    config: HubConfig,
}

impl Hub {
    /// Create a hub with sequential dispatch and no middleware.
    pub fn new() -> Self {
        Self::with_registry(
            HubConfig {
                retry: None,
                ..Default::default()
            },
            Arc::new(PlatformRegistry::new()),
        )
    }

    /// Create a hub with the middleware described by `config`.
    ///
    /// Rate limiting, when configured, runs outermost so that rejected
    /// targets are never retried.
    pub fn from_config(config: HubConfig) -> Result<Self> {
        config.validate()?;
        let hub = Self::with_registry(config, Arc::new(PlatformRegistry::new()));

        if !hub.config.rate_limits.is_empty() {
            hub.use_middleware(Arc::new(RateLimitMiddleware::from_config(
                &hub.config.rate_limits,
            )));
        }
        if let Some(retry) = &hub.config.retry {
            hub.use_middleware(Arc::new(RetryMiddleware::from_config(retry)));
        }
        Ok(hub)
    }

    /// Create a hub over an existing registry without installing any middleware.
    pub fn with_registry(config: HubConfig, registry: Arc<PlatformRegistry>) -> Self {
        let dispatcher: Arc<dyn Dispatcher> = match config.dispatch_mode {
            DispatchMode::Sequential => Arc::new(
                SequentialDispatcher::new(registry.clone())
                    .with_unknown_platform(config.unknown_platform),
            ),
            DispatchMode::Concurrent => Arc::new(
                Coordinator::with_registry(registry.clone())
                    .with_unknown_platform(config.unknown_platform),
            ),
        };

        let lifecycle = LifecycleManager::new(registry.clone(), config.health_check_interval());

        Self {
            registry,
            middlewares: RwLock::new(Vec::new()),
            dispatcher,
            lifecycle,
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PlatformRegistry> {
        &self.registry
    }

    /// Register a platform. Fails if the name is already taken.
    pub fn register_platform(&self, platform: Arc<dyn Platform>) -> Result<()> {
        self.registry.register(platform)
    }

    /// Append a middleware. The first one added runs outermost.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        debug!(middleware = middleware.name(), "Added middleware");
        self.middlewares.write().push(middleware);
    }

    /// Names of the installed middleware, outermost first.
    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middlewares.read().iter().map(|m| m.name()).collect()
    }

    /// Send `message` to `targets`.
    ///
    /// Returns `Err` only when the request itself is unusable; per-target
    /// failures are reported inside the returned [`SendingResults`].
    pub async fn send(&self, message: Message, targets: Vec<Target>) -> Result<SendingResults> {
        self.send_with_cancellation(&CancellationToken::new(), message, targets)
            .await
    }

    /// Like [`Hub::send`], but stops waiting when `token` is cancelled.
    pub async fn send_with_cancellation(
        &self,
        token: &CancellationToken,
        message: Message,
        targets: Vec<Target>,
    ) -> Result<SendingResults> {
        let message = prepare(message, &targets)?;
        let chain = self.middlewares.read().clone();

        debug!(
            message_id = %message.id,
            targets = targets.len(),
            middlewares = chain.len(),
            "Sending message"
        );

        let results = Next::new(&chain, self.dispatcher.as_ref())
            .run(token, message, targets)
            .await?;

        debug!(
            message_id = %results.message_id,
            total = results.total,
            success = results.success,
            failed = results.failed,
            "Message dispatched"
        );
        Ok(results)
    }

    /// Health-check every registered platform.
    pub async fn health(&self) -> HealthReport {
        self.registry.health_check_all().await
    }

    /// The hub's lifecycle manager. Every call returns the same instance.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Start the background health loop.
    pub fn start(&self) -> Result<()> {
        self.lifecycle.start()
    }

    /// Stop the health loop within the configured shutdown timeout and close
    /// every platform.
    pub async fn stop(&self) -> Result<()> {
        self.lifecycle.stop(self.config.shutdown_timeout()).await
    }

    /// Close every registered platform.
    pub async fn shutdown(&self) {
        info!(platforms = self.registry.len(), "Shutting down hub");
        self.registry.close_all().await;
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
