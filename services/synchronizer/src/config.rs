//! Synchronizer configuration.

use std::{path::PathBuf, time::Duration};

use amsync_reconcile::{
    Backoff, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_RECONCILE_INTERVAL,
};
use anyhow::{Context, Result};

/// Synchronizer configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON model file seeding the store.
    pub model_file: PathBuf,

    /// Interval between sync cycles.
    pub sync_interval: Duration,

    /// Timeout for each ONOS REST call.
    pub http_timeout: Duration,

    /// Retry backoff for failed records.
    pub backoff: Backoff,

    /// Run one cycle and exit.
    pub once: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_file = lookup("AMSYNC_MODEL_FILE")
            .map(PathBuf::from)
            .context("Missing model file. Set AMSYNC_MODEL_FILE.")?;

        let secs = |name: &str, default: Duration| -> Result<Duration> {
            let value: Option<u64> = lookup(name)
                .map(|v| v.trim().parse())
                .transpose()
                .with_context(|| format!("{name} must be an integer (seconds)."))?;
            Ok(value.map_or(default, Duration::from_secs))
        };

        let sync_interval = secs("AMSYNC_SYNC_INTERVAL_SECS", DEFAULT_RECONCILE_INTERVAL)?
            .max(Duration::from_secs(1));
        let http_timeout = secs("AMSYNC_HTTP_TIMEOUT_SECS", Duration::from_secs(10))?;
        let backoff = Backoff {
            base: secs("AMSYNC_BACKOFF_BASE_SECS", DEFAULT_BACKOFF_BASE)?,
            max: secs("AMSYNC_BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX)?,
        };

        let once = lookup("AMSYNC_ONCE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let log_level = lookup("AMSYNC_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            model_file,
            sync_interval,
            http_timeout,
            backoff,
            once,
            log_level,
        })
    }
}
