//! Read path across the raw and compacted tiers
//!
//! A range query is classified against the compaction boundary and routed
//! to the raw tier alone, or to both tiers with the results merged.
//! Callers always get points ascending by timestamp.

mod reader;

pub use reader::SmartReader;

use crate::bucket::AggregationInterval;
use crate::{Result, SeriesFilter, TierError, TimeRange, Timestamp};
use serde::Serialize;

/// Which tiers a range needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Entirely at or after the boundary: raw tier only
    Hot,
    /// Entirely before the boundary: buckets plus rows not yet compacted
    Cold,
    /// Straddles the boundary: buckets before it, raw rows over the whole range
    Mixed,
}

/// Classify `range` relative to the compaction `boundary`
pub fn classify(range: TimeRange, boundary: Timestamp) -> Tier {
    if range.start >= boundary {
        Tier::Hot
    } else if range.end < boundary {
        Tier::Cold
    } else {
        Tier::Mixed
    }
}

/// Where a returned point came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointSource {
    /// One raw sample
    Raw,
    /// Raw samples averaged into an interval bucket at query time
    Interval,
    /// A compacted bucket (or a roll-up of several)
    Compacted,
}

/// One point of a range query result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub device_id: String,
    pub datastream_id: String,
    /// Sample write time, or bucket start for aggregated points
    pub timestamp: Timestamp,
    /// Sample value, or mean for aggregated points
    pub value: f64,
    pub source: PointSource,
    /// Number of raw samples behind this point
    pub sample_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    /// Device attributes, raw points only
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// A range read request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeQuery {
    pub filter: SeriesFilter,
    pub range: TimeRange,
    /// Keep at most this many points, the most recent ones
    pub limit: Option<usize>,
    /// Group raw rows into buckets of this width instead of returning each row
    pub interval: Option<AggregationInterval>,
}

impl RangeQuery {
    /// Query one datastream of the given devices over `[start, end)`
    pub fn new(
        devices: Vec<String>,
        datastream: impl Into<String>,
        start: Timestamp,
        end: Timestamp,
    ) -> Self {
        Self {
            filter: SeriesFilter::new(devices, datastream),
            range: TimeRange::new(start, end),
            limit: None,
            interval: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_interval(mut self, interval: AggregationInterval) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Reject malformed requests before they reach a store
    pub fn validate(&self) -> Result<()> {
        if self.range.start > self.range.end {
            return Err(TierError::Config(format!(
                "query start {} is after end {}",
                self.range.start, self.range.end
            )));
        }
        if self.limit == Some(0) {
            return Err(TierError::Config("query limit must be positive".into()));
        }
        Ok(())
    }
}
