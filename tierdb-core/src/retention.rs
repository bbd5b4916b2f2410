//! Retention sweep over the raw tier
//!
//! Removes raw rows older than a cutoff in bounded batches. Each batch is a
//! compaction batch, so a row leaves the raw tier only in the same atomic
//! step that folds it into its bucket.

use crate::compaction::Compactor;
use crate::{Result, TierError, TimeRange, Timestamp};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Retention configuration
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Raw rows per batch
    pub batch_size: usize,
    /// Upper bound on batches per sweep
    pub max_batches: usize,
    /// Wall-clock budget for a single batch
    pub batch_deadline: std::time::Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::config::RETENTION_BATCH_SIZE,
            max_batches: crate::config::RETENTION_MAX_BATCHES,
            batch_deadline: std::time::Duration::from_secs(30),
        }
    }
}

/// Outcome of a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Bucket rows written while folding swept rows
    pub buckets_written: usize,
    /// Raw rows removed
    pub rows_deleted: usize,
    /// Batches committed
    pub batches: usize,
    /// False if the sweep stopped on the batch cap or a deadline before
    /// reaching the end of the backlog
    pub complete: bool,
}

/// Batched raw-tier cleanup
pub struct RetentionSweep {
    compactor: Arc<Compactor>,
    config: RetentionConfig,
}

impl RetentionSweep {
    pub fn new(compactor: Arc<Compactor>, config: RetentionConfig) -> Self {
        Self { compactor, config }
    }

    /// Delete every raw row created before `cutoff`, folding each batch
    /// into the compacted tier first.
    pub fn cleanup_older_than(&self, cutoff: Timestamp) -> Result<SweepReport> {
        if cutoff < DateTime::<Utc>::UNIX_EPOCH {
            return Err(TierError::Config(format!(
                "retention cutoff {cutoff} is before the epoch"
            )));
        }

        let range = TimeRange::before(cutoff);
        let mut report = SweepReport::default();

        for _ in 0..self.config.max_batches {
            let started = Instant::now();
            let (fetched, written, deleted) =
                self.compactor.compact_batch(range, self.config.batch_size)?;
            if fetched == 0 {
                report.complete = true;
                break;
            }

            report.buckets_written += written;
            report.rows_deleted += deleted;
            report.batches += 1;

            if fetched < self.config.batch_size {
                report.complete = true;
                break;
            }
            if started.elapsed() > self.config.batch_deadline {
                warn!(
                    "Retention batch took {:?}, stopping sweep after {} batches",
                    started.elapsed(),
                    report.batches
                );
                break;
            }
        }

        if !report.complete {
            warn!(
                "Retention sweep before {} stopped with rows remaining ({} deleted)",
                cutoff, report.rows_deleted
            );
        }
        info!(
            "Retention sweep before {}: {} raw rows removed in {} batches",
            cutoff, report.rows_deleted, report.batches
        );
        Ok(report)
    }
}
