//! Polling worker driving the sync step.
//!
//! Each tick runs a sync pass and then a delete pass. Passes never overlap.

use std::sync::Arc;
use std::time::Duration;

use amsync_reconcile::{run_pass, OutcomeSink, PassError, PassStats, SyncStep};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

/// Results of one tick.
#[derive(Debug)]
pub struct CycleReport<E>
where
    E: std::error::Error + 'static,
{
    pub sync: Result<PassStats, PassError<E>>,
    pub delete: Result<PassStats, PassError<E>>,
}

impl<E> CycleReport<E>
where
    E: std::error::Error + 'static,
{
    /// True if both passes ran to completion.
    pub fn is_complete(&self) -> bool {
        self.sync.is_ok() && self.delete.is_ok()
    }
}

/// Runs a [`SyncStep`] on a fixed interval, reporting to an [`OutcomeSink`].
pub struct SyncWorker<T, K> {
    step: T,
    sink: Arc<K>,
    interval: Duration,
}

impl<T, K> SyncWorker<T, K>
where
    T: SyncStep,
    K: OutcomeSink<T::Item>,
{
    pub fn new(step: T, sink: Arc<K>, interval: Duration) -> Self {
        Self {
            step,
            sink,
            interval,
        }
    }

    /// Run one sync pass followed by one delete pass.
    #[instrument(skip(self), fields(step = self.step.name()))]
    pub async fn run_cycle(&self) -> CycleReport<T::Error> {
        let sync = run_pass(&self.step, self.sink.as_ref(), false).await;
        match &sync {
            Ok(stats) => info!(
                fetched = stats.fetched,
                synced = stats.synced,
                deferred = stats.deferred,
                failed = stats.failed,
                "Sync pass complete"
            ),
            Err(e) => error!(error = %e, "Sync pass aborted"),
        }

        let delete = run_pass(&self.step, self.sink.as_ref(), true).await;
        match &delete {
            Ok(stats) if stats.fetched > 0 => info!(
                fetched = stats.fetched,
                purged = stats.synced,
                failed = stats.failed,
                "Delete pass complete"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Delete pass aborted"),
        }

        let report = CycleReport { sync, delete };
        if let Ok(stats) = &report.sync {
            if stats.unreported > 0 {
                warn!(unreported = stats.unreported, "Some outcomes were not recorded");
            }
        }
        report
    }

    /// Run cycles until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            step = self.step.name(),
            interval_secs = self.interval.as_secs(),
            "Starting sync worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sync worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
