//! Tier-aware range reader

use super::{classify, PointSource, RangeQuery, SeriesPoint, Tier};
use crate::aggregates::SummaryAccumulator;
use crate::bucket::{bucket_of, AggregationInterval, BucketWidth};
use crate::clock::Clock;
use crate::compaction::compaction_boundary;
use crate::store::TierStore;
use crate::{Bucket, BucketKey, Result, Sample, TierError, TimeRange, Timestamp};
use chrono::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes range queries to the tier(s) holding the data
pub struct SmartReader {
    store: Arc<dyn TierStore>,
    clock: Arc<dyn Clock>,
    width: BucketWidth,
    delay: Duration,
}

impl SmartReader {
    pub fn new(
        store: Arc<dyn TierStore>,
        clock: Arc<dyn Clock>,
        width: BucketWidth,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            width,
            delay,
        }
    }

    /// The boundary the next query will split on
    pub fn boundary(&self) -> Timestamp {
        compaction_boundary(self.clock.now(), self.delay, self.width)
    }

    /// Run a range query.
    ///
    /// Points come back ascending by timestamp. Any tier failure is retried
    /// once against the raw tier over the whole range; only if that also
    /// fails does the caller see an error.
    pub fn query(&self, query: &RangeQuery) -> Result<Vec<SeriesPoint>> {
        query.validate()?;
        if query.range.is_empty() {
            return Ok(Vec::new());
        }

        let boundary = self.boundary();
        let tier = classify(query.range, boundary);
        debug!(
            "Range [{}, {}) classified {:?} against boundary {}",
            query.range.start, query.range.end, tier, boundary
        );

        let points = match self.read_tiers(query, tier, boundary) {
            Ok(points) => points,
            Err(err) => {
                warn!("{:?} read failed ({}), retrying against raw tier", tier, err);
                self.read_raw(query, query.range).map_err(|retry| {
                    TierError::Query(format!("{err}; raw retry failed: {retry}"))
                })?
            }
        };
        Ok(finish(points, query.limit))
    }

    fn read_tiers(
        &self,
        query: &RangeQuery,
        tier: Tier,
        boundary: Timestamp,
    ) -> Result<Vec<SeriesPoint>> {
        if tier == Tier::Hot {
            return self.read_raw(query, query.range);
        }

        // Gated runs leave raw rows behind the boundary until the next tick, and
        // sweeps fold only what they reach. A live raw row was never counted into
        // a bucket, so the cold part reads both tiers and the raw rows merge in.
        let cold_end = query.range.end.min(boundary);
        let mut points = self.read_compacted(query, TimeRange::new(query.range.start, cold_end))?;
        points.extend(self.read_raw(query, query.range)?);
        Ok(points)
    }

    /// Compacted buckets starting in `range`
    fn read_compacted(&self, query: &RangeQuery, range: TimeRange) -> Result<Vec<SeriesPoint>> {
        // Buckets are labelled by their start, so widen to the bucket holding `range.start`
        let bucket_range = TimeRange::new(bucket_of(range.start, self.width), range.end);
        let buckets = self.store.compacted_range(&query.filter, bucket_range)?;
        if buckets.is_empty() {
            debug!("No buckets in [{}, {}), raw tier only", range.start, range.end);
            return Ok(Vec::new());
        }

        let points = match query.interval {
            Some(interval) if interval.width().minutes() > self.width.minutes() => {
                roll_up(&buckets, interval)
            }
            _ => buckets.iter().map(point_from_bucket).collect(),
        };
        Ok(points)
    }

    fn read_raw(&self, query: &RangeQuery, range: TimeRange) -> Result<Vec<SeriesPoint>> {
        let rows = self.store.raw_range(&query.filter, range, None)?;
        Ok(match query.interval {
            Some(interval) => group_rows(&rows, interval),
            None => rows.into_iter().map(point_from_sample).collect(),
        })
    }
}

fn point_from_sample(sample: Sample) -> SeriesPoint {
    SeriesPoint {
        device_id: sample.device_id,
        datastream_id: sample.datastream_id,
        timestamp: sample.created_at,
        value: sample.value,
        source: PointSource::Raw,
        sample_count: 1,
        min_value: None,
        max_value: None,
        payload: sample.payload,
    }
}

fn point_from_bucket(bucket: &Bucket) -> SeriesPoint {
    SeriesPoint {
        device_id: bucket.device_id.clone(),
        datastream_id: bucket.datastream_id.clone(),
        timestamp: bucket.time_bucket,
        value: bucket.avg_value,
        source: PointSource::Compacted,
        sample_count: bucket.sample_count,
        min_value: Some(bucket.min_value),
        max_value: Some(bucket.max_value),
        payload: serde_json::Value::Null,
    }
}

fn point_from_group(key: &BucketKey, acc: &SummaryAccumulator, source: PointSource) -> Option<SeriesPoint> {
    Some(SeriesPoint {
        device_id: key.series.device_id.clone(),
        datastream_id: key.series.datastream_id.clone(),
        timestamp: key.time_bucket,
        value: acc.mean()?,
        source,
        sample_count: acc.count(),
        min_value: acc.min(),
        max_value: acc.max(),
        payload: serde_json::Value::Null,
    })
}

/// Average raw rows into interval buckets
fn group_rows(rows: &[Sample], interval: AggregationInterval) -> Vec<SeriesPoint> {
    let mut groups: BTreeMap<BucketKey, SummaryAccumulator> = BTreeMap::new();
    for row in rows {
        let key = BucketKey {
            series: row.series(),
            time_bucket: bucket_of(row.created_at, interval.width()),
        };
        groups.entry(key).or_default().add(row.value);
    }
    groups
        .iter()
        .filter_map(|(key, acc)| point_from_group(key, acc, PointSource::Interval))
        .collect()
}

/// Combine compacted buckets into coarser interval buckets, weighting by count
fn roll_up(buckets: &[Bucket], interval: AggregationInterval) -> Vec<SeriesPoint> {
    let mut groups: BTreeMap<BucketKey, SummaryAccumulator> = BTreeMap::new();
    for bucket in buckets {
        let mut key = bucket.key();
        key.time_bucket = bucket_of(key.time_bucket, interval.width());
        groups.entry(key).or_default().add_bucket(bucket);
    }
    groups
        .iter()
        .filter_map(|(key, acc)| point_from_group(key, acc, PointSource::Compacted))
        .collect()
}

/// Sort ascending, fold aggregated points sharing a (device, datastream,
/// timestamp) key and keep only the most recent `limit` points.
///
/// Every row lives in exactly one tier, so two aggregated points on the same
/// key cover disjoint rows and are folded together. Raw points are never
/// collapsed: two samples written at the same instant are both returned.
fn finish(mut points: Vec<SeriesPoint>, limit: Option<usize>) -> Vec<SeriesPoint> {
    points.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.device_id.cmp(&b.device_id))
            .then_with(|| a.datastream_id.cmp(&b.datastream_id))
            .then_with(|| is_aggregate(b).cmp(&is_aggregate(a)))
    });

    let mut merged: Vec<SeriesPoint> = Vec::with_capacity(points.len());
    for point in points {
        match merged.last_mut() {
            Some(last)
                if is_aggregate(last)
                    && is_aggregate(&point)
                    && last.timestamp == point.timestamp
                    && last.device_id == point.device_id
                    && last.datastream_id == point.datastream_id =>
            {
                fold(last, &point);
            }
            _ => merged.push(point),
        }
    }

    if let Some(limit) = limit {
        if merged.len() > limit {
            merged.drain(..merged.len() - limit);
        }
    }
    merged
}

fn is_aggregate(point: &SeriesPoint) -> bool {
    point.source != PointSource::Raw
}

fn fold(into: &mut SeriesPoint, other: &SeriesPoint) {
    let total = into.sample_count + other.sample_count;
    if total == 0 {
        return;
    }
    into.value = (into.value * into.sample_count as f64 + other.value * other.sample_count as f64)
        / total as f64;
    into.min_value = match (into.min_value, other.min_value) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    into.max_value = match (into.max_value, other.max_value) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    into.sample_count = total;
}
