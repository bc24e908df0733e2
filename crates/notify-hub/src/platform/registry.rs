//! Name-keyed platform registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{HealthReport, Platform, PlatformHealth};
use crate::{Error, Result};

/// Concurrency-safe store of registered platforms.
///
/// Registration and lookups may interleave freely; a lookup holds the read
/// lock only long enough to clone the platform handle.
#[derive(Default)]
pub struct PlatformRegistry {
    platforms: RwLock<HashMap<String, Arc<dyn Platform>>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a platform under its own name.
    ///
    /// Fails without replacing anything if the name is already taken.
    pub fn register(&self, platform: Arc<dyn Platform>) -> Result<()> {
        let name = platform.name().to_string();
        if name.trim().is_empty() {
            return Err(Error::config("platform name must not be empty"));
        }

        let mut platforms = self.platforms.write();
        if platforms.contains_key(&name) {
            return Err(Error::DuplicatePlatform(name));
        }
        platforms.insert(name.clone(), platform);
        info!(platform = %name, "Registered platform");
        Ok(())
    }

    /// Remove a platform, returning it if it was registered.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Platform>> {
        let removed = self.platforms.write().remove(name);
        if removed.is_some() {
            debug!(platform = %name, "Unregistered platform");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Platform>> {
        self.platforms.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.platforms.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.platforms.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.platforms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.read().is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Platform>)> {
        self.platforms
            .read()
            .iter()
            .map(|(name, platform)| (name.clone(), Arc::clone(platform)))
            .collect()
    }

    /// Probe every registered platform concurrently.
    pub async fn health_check_all(&self) -> HealthReport {
        let probes = self.snapshot().into_iter().map(|(name, platform)| async move {
            let start = Instant::now();
            let outcome = platform.health_check().await;
            let check_duration_ms = start.elapsed().as_millis() as u64;
            let health = match outcome {
                Ok(()) => PlatformHealth {
                    healthy: true,
                    message: None,
                    check_duration_ms,
                },
                Err(e) => PlatformHealth {
                    healthy: false,
                    message: Some(e.to_string()),
                    check_duration_ms,
                },
            };
            (name, health)
        });

        HealthReport::from_details(join_all(probes).await.into_iter().collect())
    }

    /// Close every registered platform once.
    ///
    /// Failures are logged and do not stop the remaining platforms from closing.
    pub async fn close_all(&self) {
        for (name, platform) in self.snapshot() {
            match platform.close().await {
                Ok(()) => debug!(platform = %name, "Closed platform"),
                Err(e) => warn!(platform = %name, error = %e, "Failed to close platform"),
            }
        }
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.names())
            .finish()
    }
}
