//! Compaction of aged raw samples into fixed-width buckets
//!
//! Raw rows older than the compaction boundary are grouped by
//! (device, datastream, bucket), aggregated, and handed to the store as one
//! [`CompactionBatch`]: the bucket upserts and the raw deletions commit
//! together or not at all.

mod gate;

pub use gate::CompactionGate;

use crate::aggregates::SummaryAccumulator;
use crate::bucket::{bucket_of, BucketWidth};
use crate::store::{CompactionBatch, TierStore};
use crate::{BucketKey, Result, Sample, SeriesFilter, TierError, TimeRange, Timestamp};
use chrono::Duration;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Compaction configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Width of compacted buckets
    pub bucket_width: BucketWidth,
    /// Distance between now and the compaction boundary
    pub delay: Duration,
    /// How far behind the boundary a gated run looks
    pub lookback: Duration,
    /// Raw rows aggregated per atomic batch
    pub batch_rows: usize,
    /// Wall-clock budget for a single batch
    pub batch_deadline: std::time::Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            bucket_width: BucketWidth::DEFAULT,
            delay: Duration::minutes(10),
            lookback: Duration::hours(1),
            batch_rows: crate::config::COMPACTION_BATCH_ROWS,
            batch_deadline: std::time::Duration::from_secs(30),
        }
    }
}

/// Outcome of a compaction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Bucket rows inserted or merged into
    pub buckets_written: usize,
    /// Raw rows folded into buckets and removed
    pub rows_deleted: usize,
    /// Atomic batches committed
    pub batches: usize,
}

impl CompactionReport {
    fn add(&mut self, buckets_written: usize, rows_deleted: usize) {
        self.buckets_written += buckets_written;
        self.rows_deleted += rows_deleted;
        self.batches += 1;
    }
}

/// Timestamp separating the raw-only range from the compactable range.
///
/// Floored to a bucket start so gated runs always cover whole buckets and
/// the read path splits tiers on the same line.
pub fn compaction_boundary(now: Timestamp, delay: Duration, width: BucketWidth) -> Timestamp {
    bucket_of(now - delay, width)
}

/// Folds aged raw rows into the compacted tier
pub struct Compactor {
    store: Arc<dyn TierStore>,
    config: CompactionConfig,
}

impl Compactor {
    /// Create a new compactor
    pub fn new(store: Arc<dyn TierStore>, config: CompactionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Compaction boundary as seen at `now`
    pub fn boundary(&self, now: Timestamp) -> Timestamp {
        compaction_boundary(now, self.config.delay, self.config.bucket_width)
    }

    /// Compact raw rows created before `before`, looking back at most the
    /// configured lookback window.
    pub fn compact(&self, before: Timestamp) -> Result<CompactionReport> {
        let from = bucket_of(before - self.config.lookback, self.config.bucket_width);
        self.compact_range(TimeRange::new(from, before))
    }

    /// Compact every raw row in `range`, one atomic batch at a time.
    ///
    /// A failed batch is not applied; batches committed before it stay.
    pub fn compact_range(&self, range: TimeRange) -> Result<CompactionReport> {
        let mut report = CompactionReport::default();
        loop {
            let (fetched, written, deleted) = self.compact_batch(range, self.config.batch_rows)?;
            if fetched == 0 {
                break;
            }
            report.add(written, deleted);
            if fetched < self.config.batch_rows || deleted == 0 {
                break;
            }
        }

        if report.rows_deleted > 0 {
            info!(
                "Compacted {} raw rows into {} buckets in {} batches (before {})",
                report.rows_deleted, report.buckets_written, report.batches, range.end
            );
        } else {
            debug!("Nothing to compact before {}", range.end);
        }
        Ok(report)
    }

    /// Aggregate and commit the oldest `limit` raw rows in `range`.
    ///
    /// Returns (rows fetched, buckets written, rows deleted).
    pub(crate) fn compact_batch(
        &self,
        range: TimeRange,
        limit: usize,
    ) -> Result<(usize, usize, usize)> {
        let started = Instant::now();

        let rows = self.store.raw_range(&SeriesFilter::all(), range, Some(limit))?;
        if rows.is_empty() {
            return Ok((0, 0, 0));
        }
        let batch = aggregate(&rows, self.config.bucket_width);

        let elapsed = started.elapsed();
        if elapsed > self.config.batch_deadline {
            return Err(TierError::DeadlineExceeded {
                operation: "compaction",
                elapsed_ms: elapsed.as_millis(),
            });
        }

        let applied = self.store.apply_compaction(&batch)?;
        Ok((rows.len(), applied.buckets_written, applied.rows_deleted))
    }
}

/// Group raw rows by (series, bucket) and aggregate each group.
///
/// Pure function of the rows and the width: the same rows always produce
/// the same batch.
pub fn aggregate(rows: &[Sample], width: BucketWidth) -> CompactionBatch {
    let mut groups: BTreeMap<BucketKey, SummaryAccumulator> = BTreeMap::new();
    for row in rows {
        let key = BucketKey {
            series: row.series(),
            time_bucket: bucket_of(row.created_at, width),
        };
        groups.entry(key).or_default().add(row.value);
    }

    CompactionBatch {
        buckets: groups
            .iter()
            .filter_map(|(key, acc)| acc.to_bucket(&key.series, key.time_bucket))
            .collect(),
        consumed: rows.iter().map(|r| r.id).collect(),
    }
}
