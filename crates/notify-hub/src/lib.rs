//! notify-hub: multi-platform notification dispatch.
//!
//! A [`Hub`] validates a message and its targets, passes them through an
//! ordered middleware chain (retry, rate limiting, ...) and fans the targets
//! out to registered [`Platform`]s. Every target ends up with exactly one
//! [`DeliveryResult`] inside the returned [`SendingResults`].
//!
//! [`Coordinator`] is the parallel variant: one task per platform group.
//! [`LifecycleManager`] runs a background health loop over the registry.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod logging;
pub mod message;
pub mod middleware;
pub mod platform;
pub mod result;
pub mod target;

pub use config::{BackoffKind, DispatchMode, HubConfig, RateLimitConfig, RetryConfig};
pub use coordinator::Coordinator;
pub use dispatch::{Dispatcher, SequentialDispatcher, UnknownPlatformPolicy};
pub use error::{Error, ErrorKind, Result};
pub use hub::Hub;
pub use lifecycle::LifecycleManager;
pub use message::{Message, MessageFormat, Priority};
pub use middleware::{Middleware, Next, RateLimitMiddleware, RetryMiddleware};
pub use platform::{HealthReport, Platform, PlatformHealth, PlatformRegistry};
pub use result::{DeliveryResult, DeliveryStatus, SendingResults};
pub use target::Target;
