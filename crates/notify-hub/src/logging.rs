//! Optional `tracing` subscriber setup for binaries embedding the hub.
//!
//! Library code only emits events; installing a subscriber is left to the
//! embedder. [`init_logging`] wires a reloadable `EnvFilter` to a `fmt` layer
//! with local-time timestamps.

use chrono::Local;
use tracing::info;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "notify_hub=info";

/// Timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed filter.
#[derive(Clone)]
pub struct LogHandle {
    handle: FilterHandle,
}

impl LogHandle {
    /// Current filter directive.
    pub fn filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive at runtime.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = parse_filter(directive)?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::config(format!("Failed to reload filter: {}", e)))?;
        info!(directive = %directive, "Log filter updated");
        Ok(())
    }
}

fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))
}

/// Install the global subscriber.
///
/// `directive` falls back to `RUST_LOG`, then to [`DEFAULT_LOG_FILTER`].
/// Fails on an invalid directive or if a global subscriber is already set.
pub fn init_logging(directive: Option<&str>) -> Result<LogHandle> {
    let filter = match directive {
        Some(directive) => parse_filter(directive)?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
            .map_err(|e| Error::config(format!("Invalid filter directive: {}", e)))?,
    };

    let (filter_layer, handle) = reload::Layer::new(filter);
    let fmt_layer = fmt::layer().with_timer(LocalTimer).with_target(true);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to install subscriber: {}", e)))?;

    Ok(LogHandle { handle })
}
