//! Aggregate accumulators shared by compaction and interval queries

use crate::{Bucket, SeriesId, Timestamp};

/// Running count/mean/min/max over a set of values.
///
/// Tracks the sum rather than a running mean so that folding in a
/// pre-aggregated bucket (mean weighted by its count) is exact.
#[derive(Debug, Clone, Default)]
pub struct SummaryAccumulator {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl SummaryAccumulator {
    /// Add a raw value
    pub fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }

    /// Fold in an already-aggregated bucket
    pub fn add_bucket(&mut self, bucket: &Bucket) {
        if bucket.sample_count == 0 {
            return;
        }
        self.count += bucket.sample_count;
        self.sum += bucket.avg_value * bucket.sample_count as f64;
        self.min = Some(self.min.map_or(bucket.min_value, |m| m.min(bucket.min_value)));
        self.max = Some(self.max.map_or(bucket.max_value, |m| m.max(bucket.max_value)));
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count > 0 {
            Some(self.sum / self.count as f64)
        } else {
            None
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    /// Materialize as a bucket row; `None` if nothing was accumulated
    pub fn to_bucket(&self, series: &SeriesId, time_bucket: Timestamp) -> Option<Bucket> {
        let avg_value = self.mean()?;
        Some(Bucket {
            device_id: series.device_id.clone(),
            datastream_id: series.datastream_id.clone(),
            avg_value,
            min_value: self.min?,
            max_value: self.max?,
            sample_count: self.count,
            time_bucket,
        })
    }
}
