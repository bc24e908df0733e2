//! Delivery platforms.
//!
//! A platform is a pluggable backend (chat webhook, SMTP relay, SMS gateway, ...)
//! that delivers a message to the targets routed to it. The hub only talks to
//! platforms through the [`Platform`] trait; formatting and signing live in
//! the implementations.

mod registry;
pub mod webhook;

pub use registry::PlatformRegistry;
pub use webhook::{WebhookAuth, WebhookConfig, WebhookPlatform};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::message::Message;
use crate::result::DeliveryResult;
use crate::target::Target;

/// Trait for delivery platforms.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Stable registry key.
    fn name(&self) -> &str;

    /// Deliver `message` to every target in `targets`.
    ///
    /// Implementations return one result per target. A returned `Err` means the
    /// whole batch failed before any per-target outcome was known.
    async fn send(
        &self,
        token: &CancellationToken,
        message: &Message,
        targets: &[Target],
    ) -> Result<Vec<DeliveryResult>>;

    /// Pre-flight check run before any network call.
    fn validate(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    /// Cheap liveness flag.
    fn is_available(&self) -> bool {
        true
    }

    /// Active health probe.
    async fn health_check(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(crate::Error::transport(format!(
                "platform {} is unavailable",
                self.name()
            )))
        }
    }

    /// Release held resources. Must be idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Health of a single platform.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformHealth {
    pub healthy: bool,
    pub message: Option<String>,
    pub check_duration_ms: u64,
}

/// Aggregated health of every registered platform.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub details: HashMap<String, PlatformHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_details(details: HashMap<String, PlatformHealth>) -> Self {
        Self {
            healthy: details.values().all(|h| h.healthy),
            details,
            checked_at: Utc::now(),
        }
    }

    /// Names of the platforms that failed their last probe.
    pub fn unhealthy(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .details
            .iter()
            .filter(|(_, h)| !h.healthy)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

impl Default for HealthReport {
    fn default() -> Self {
        Self::from_details(HashMap::new())
    }
}
