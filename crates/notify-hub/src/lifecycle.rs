//! Start/stop state machine with a background health loop.
//!
//! States: stopped, running, stopping. A stop that misses its deadline leaves
//! the manager in the stopping state until [`LifecycleManager::force_stop`]
//! is called.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::platform::{HealthReport, PlatformRegistry};
use crate::{Error, Result};

struct HealthTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs periodic health checks over a platform registry.
pub struct LifecycleManager {
    registry: Arc<PlatformRegistry>,
    interval: Duration,
    running: AtomicBool,
    stopping: AtomicBool,
    task: Mutex<Option<HealthTask>>,
    last_health: Arc<RwLock<HealthReport>>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<PlatformRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            task: Mutex::new(None),
            last_health: Arc::new(RwLock::new(HealthReport::default())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Report produced by the most recent health check.
    pub fn last_health(&self) -> HealthReport {
        self.last_health.read().clone()
    }

    /// Start the health loop. The first check runs immediately.
    pub fn start(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::config("health check interval must be > 0"));
        }
        // Held until the task is stored: a running manager always owns its task.
        let mut slot = self.task.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(health_loop(
            self.registry.clone(),
            self.interval,
            cancel.clone(),
            self.last_health.clone(),
        ));
        *slot = Some(HealthTask { cancel, handle });
        drop(slot);

        info!(interval_secs = self.interval.as_secs_f64(), "Hub started");
        Ok(())
    }

    /// Stop the health loop, waiting at most `timeout` for it to finish.
    ///
    /// On success every registered platform is closed and the manager is
    /// stopped. On timeout the manager stays in the stopping state.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        if self
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyStopping);
        }

        info!("Hub stopping");
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            task.cancel.cancel();
            match tokio::time::timeout(timeout, &mut task.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Health task ended abnormally"),
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Health task did not stop in time");
                    *self.task.lock() = Some(task);
                    return Err(Error::ShutdownTimeout(timeout));
                }
            }
        }

        self.registry.close_all().await;
        self.running.store(false, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);
        info!("Hub stopped");
        Ok(())
    }

    /// Abort the health task without waiting and reset to stopped.
    ///
    /// Platforms are left open.
    pub fn force_stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
            warn!("Health task aborted");
        }
        self.running.store(false, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

async fn health_loop(
    registry: Arc<PlatformRegistry>,
    interval: Duration,
    cancel: CancellationToken,
    last_health: Arc<RwLock<HealthReport>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Health loop cancelled");
                break;
            }
            _ = ticker.tick() => {
                let report = registry.health_check_all().await;
                if report.healthy {
                    debug!(platforms = report.details.len(), "Health check passed");
                } else {
                    warn!(unhealthy = ?report.unhealthy(), "Unhealthy platforms");
                }
                *last_health.write() = report;
            }
        }
    }
}
