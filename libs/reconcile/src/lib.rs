//! Reconciliation loop primitives.
//!
//! This library provides the generic driver for a sync step: something that
//! observes a set of pending records, pushes each one to an external system,
//! and reports per-record outcomes back to whoever owns the records.
//!
//! - **Pending**: records whose desired state has not been enacted yet.
//! - **Outcome**: what happened to one record in one pass.
//! - **Disposition**: how an error from the step should be treated.
//!
//! # Invariants
//!
//! - Records are processed sequentially, in the order the step returns them
//! - One record's failure never prevents its siblings from being processed,
//!   unless the step classifies the error as fatal for the whole pass
//! - Every processed record gets exactly one reported outcome

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// How the driver should treat an error raised by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Expected and transient; retry on a later pass without counting it as
    /// a failure.
    Deferred,

    /// This record failed this pass; keep going with the others.
    ItemFailed,

    /// Nothing in this pass can succeed; stop after recording this record.
    PassFatal,
}

/// Errors that know their own [`Disposition`].
pub trait Classify {
    fn disposition(&self) -> Disposition;
}

/// Result of processing one record in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The external system now matches the record.
    Synced,

    /// Not ready yet; the reason is kept for status reporting.
    Deferred(String),

    /// The attempt failed; the message is kept for status reporting.
    Failed(String),

    /// The pass stopped on this record for a reason that is not the
    /// record's own. Reported without backoff.
    Aborted(String),
}

impl Outcome {
    /// Returns true if the record was synced.
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }

    /// Returns true if the record was deferred.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

/// A sync step: observes records of one kind and enacts them.
#[async_trait]
pub trait SyncStep: Send + Sync {
    /// Record type the step observes.
    type Item: Display + Send + Sync;

    /// Error type raised by the step.
    type Error: std::error::Error + Classify + Send + Sync + 'static;

    /// Step name for logs.
    fn name(&self) -> &'static str;

    /// Records pending synchronization (or deletion, when `deleted`).
    async fn fetch_pending(&self, deleted: bool) -> Result<Vec<Self::Item>, Self::Error>;

    /// Push one record to the external system.
    async fn sync_record(&self, item: &Self::Item) -> Result<(), Self::Error>;

    /// Retract one deleted record from the external system.
    async fn delete_record(&self, item: &Self::Item) -> Result<(), Self::Error>;
}

/// Receives per-record outcomes (usually the model store).
#[async_trait]
pub trait OutcomeSink<T: Send + Sync>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn report_outcome(
        &self,
        item: &T,
        deleted: bool,
        outcome: &Outcome,
    ) -> Result<(), Self::Error>;
}

/// Errors that end a pass early.
#[derive(Debug, Error)]
pub enum PassError<E>
where
    E: std::error::Error + 'static,
{
    /// The pending set could not be fetched.
    #[error("failed to fetch pending records: {0}")]
    Fetch(#[source] E),

    /// A record raised an error classified as fatal for the pass.
    #[error("pass aborted at {item}: {source}")]
    Aborted {
        item: String,
        #[source]
        source: E,
    },
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub fetched: usize,
    pub synced: usize,
    pub deferred: usize,
    pub failed: usize,
    pub unreported: usize,
}

/// Run one pass of `step`, reporting every outcome to `sink`.
#[instrument(skip(step, sink), fields(step = step.name()))]
pub async fn run_pass<S, K>(
    step: &S,
    sink: &K,
    deleted: bool,
) -> Result<PassStats, PassError<S::Error>>
where
    S: SyncStep,
    K: OutcomeSink<S::Item>,
{
    let items = step.fetch_pending(deleted).await.map_err(PassError::Fetch)?;
    let mut stats = PassStats {
        fetched: items.len(),
        ..PassStats::default()
    };

    for item in &items {
        let result = if deleted {
            step.delete_record(item).await
        } else {
            step.sync_record(item).await
        };

        let (outcome, fatal) = match result {
            Ok(()) => {
                stats.synced += 1;
                (Outcome::Synced, None)
            }
            Err(e) => match e.disposition() {
                Disposition::Deferred => {
                    info!(item = %item, reason = %e, "deferred; will retry next pass");
                    stats.deferred += 1;
                    (Outcome::Deferred(e.to_string()), None)
                }
                Disposition::ItemFailed => {
                    error!(item = %item, error = %e, "sync failed");
                    stats.failed += 1;
                    (Outcome::Failed(e.to_string()), None)
                }
                Disposition::PassFatal => {
                    error!(item = %item, error = %e, "sync failed; aborting pass");
                    stats.failed += 1;
                    (Outcome::Aborted(e.to_string()), Some(e))
                }
            },
        };

        if let Err(e) = sink.report_outcome(item, deleted, &outcome).await {
            warn!(item = %item, error = %e, "failed to record outcome");
            stats.unreported += 1;
        }

        if let Some(source) = fatal {
            return Err(PassError::Aborted {
                item: item.to_string(),
                source,
            });
        }
    }

    Ok(stats)
}

/// Exponential backoff for records that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base: Duration,

    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl Backoff {
    /// Delay before retrying a record that has failed `exponent` times in a
    /// row: `base * 2^(exponent - 1)`, capped at `max`. Zero failures means
    /// no delay.
    pub fn delay(&self, exponent: u32) -> Duration {
        if exponent == 0 {
            return Duration::ZERO;
        }

        2u32.checked_pow(exponent - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// Default interval between passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay after a first failure.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10 * 60); // 10 minutes
