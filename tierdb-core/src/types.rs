//! Core types for TierDB

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wall-clock timestamp (UTC)
pub type Timestamp = DateTime<Utc>;

/// Raw-tier row identifier, assigned in write order
pub type SampleId = u64;

/// Identity of one time series: a datastream reported by a device
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesId {
    pub device_id: String,
    pub datastream_id: String,
}

impl SeriesId {
    /// Create a new series id
    pub fn new(device_id: impl Into<String>, datastream_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            datastream_id: datastream_id.into(),
        }
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.datastream_id)
    }
}

/// A sample as handed over by the ingestion path, before it is stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSample {
    pub device_id: String,
    pub datastream_id: String,
    pub value: f64,
    /// Opaque device-reported attributes
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewSample {
    /// Create a new sample with an empty payload
    pub fn new(device_id: impl Into<String>, datastream_id: impl Into<String>, value: f64) -> Self {
        Self {
            device_id: device_id.into(),
            datastream_id: datastream_id.into(),
            value,
            payload: serde_json::Value::Null,
        }
    }

    /// Attach device-reported attributes
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A stored raw-tier sample. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,
    pub device_id: String,
    pub datastream_id: String,
    pub value: f64,
    /// Write time
    pub created_at: Timestamp,
    pub payload: serde_json::Value,
}

impl Sample {
    /// Series this sample belongs to
    pub fn series(&self) -> SeriesId {
        SeriesId::new(&self.device_id, &self.datastream_id)
    }
}

/// Unique key of a compacted bucket
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub series: SeriesId,
    pub time_bucket: Timestamp,
}

/// A compacted-tier aggregate over one fixed-width interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub device_id: String,
    pub datastream_id: String,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub sample_count: u64,
    /// Start of the interval
    pub time_bucket: Timestamp,
}

impl Bucket {
    /// Uniqueness key: (device, datastream, bucket start)
    pub fn key(&self) -> BucketKey {
        BucketKey {
            series: SeriesId::new(&self.device_id, &self.datastream_id),
            time_bucket: self.time_bucket,
        }
    }

    /// Fold an aggregate over disjoint rows of the same bucket into this one.
    ///
    /// The mean is weighted by sample count so the result equals the mean of
    /// the union of both row sets.
    pub fn absorb(&mut self, other: &Bucket) {
        let total = self.sample_count + other.sample_count;
        if total == 0 {
            return;
        }
        self.avg_value = (self.avg_value * self.sample_count as f64
            + other.avg_value * other.sample_count as f64)
            / total as f64;
        self.min_value = self.min_value.min(other.min_value);
        self.max_value = self.max_value.max(other.max_value);
        self.sample_count = total;
    }
}

/// Single-row compaction gate state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_check_time: Timestamp,
    /// Id of the run that last advanced the checkpoint
    pub run_id: Option<Uuid>,
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering everything strictly before `end`
    pub fn before(end: Timestamp) -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end,
        }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if the range selects nothing
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Which series a read or maintenance operation touches
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SeriesFilter {
    /// Devices to include; empty means every device
    pub devices: Vec<String>,
    /// Datastream to include; `None` means every datastream
    pub datastream: Option<String>,
}

impl SeriesFilter {
    /// Match every series
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one datastream across the given devices
    pub fn new(devices: Vec<String>, datastream: impl Into<String>) -> Self {
        Self {
            devices,
            datastream: Some(datastream.into()),
        }
    }

    /// Check whether a series passes the filter
    pub fn matches(&self, device_id: &str, datastream_id: &str) -> bool {
        let device_ok = self.devices.is_empty() || self.devices.iter().any(|d| d == device_id);
        let stream_ok = self.datastream.as_deref().map_or(true, |s| s == datastream_id);
        device_ok && stream_ok
    }
}
