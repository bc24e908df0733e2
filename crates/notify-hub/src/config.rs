//! Hub configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::UnknownPlatformPolicy;
use crate::error::ErrorKind;
use crate::{Error, Result};

/// Default health check interval (30 seconds).
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Default bound on a graceful stop (10 seconds).
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// How the core dispatch stage fans out across platform groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One platform group after another, one target at a time.
    #[default]
    Sequential,
    /// One concurrent task per platform group.
    Concurrent,
}

/// Backoff strategy selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    #[default]
    ExponentialJitter,
    Linear,
    Constant,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum retries per target, not counting the first attempt.
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffKind,
    /// Error kinds that are never retried. `None` keeps the built-in list.
    pub non_retryable: Option<Vec<ErrorKind>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff: BackoffKind::ExponentialJitter,
            non_retryable: None,
        }
    }
}

/// Token bucket settings for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst size.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

/// Configuration for the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Core dispatch stage.
    pub dispatch_mode: DispatchMode,
    /// Handling of targets routed to unregistered platforms.
    pub unknown_platform: UnknownPlatformPolicy,
    /// Retry middleware settings. `None` disables retries.
    pub retry: Option<RetryConfig>,
    /// Rate limits keyed by platform name.
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// Interval between background health checks in seconds.
    pub health_check_interval_secs: u64,
    /// Bound on a graceful stop in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Sequential,
            unknown_platform: UnknownPlatformPolicy::Fail,
            retry: Some(RetryConfig::default()),
            rate_limits: HashMap::new(),
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

impl HubConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject settings the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval_secs == 0 {
            return Err(Error::config("health_check_interval_secs must be > 0"));
        }
        if let Some(retry) = &self.retry
            && retry.max_delay_ms < retry.initial_delay_ms
        {
            return Err(Error::config(format!(
                "retry.max_delay_ms ({}) is below retry.initial_delay_ms ({})",
                retry.max_delay_ms, retry.initial_delay_ms
            )));
        }
        for (platform, limit) in &self.rate_limits {
            if !limit.refill_per_sec.is_finite() || limit.refill_per_sec < 0.0 {
                return Err(Error::config(format!(
                    "rate limit for {} has invalid refill_per_sec {}",
                    platform, limit.refill_per_sec
                )));
            }
        }
        Ok(())
    }
}
