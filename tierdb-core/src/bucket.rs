//! Bucket assignment
//!
//! Bucket boundaries are a pure function of a timestamp and a width. The
//! width is anchored to the top of the hour (or midnight for multi-hour
//! widths): the hour and day components of the input are kept as-is and
//! only the minute-of-day is floored, so boundaries never drift with the
//! time compaction happens to run.

use crate::{Result, TierError, Timestamp};
use chrono::{Duration, Timelike};
use std::fmt;
use std::str::FromStr;

const MINUTES_PER_HOUR: u32 = 60;
const MINUTES_PER_DAY: u32 = 24 * 60;

/// Validated bucket width in minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketWidth(u32);

impl BucketWidth {
    /// Width used by the compacted tier unless configured otherwise
    pub const DEFAULT: BucketWidth = BucketWidth(5);

    /// Build a width, rejecting widths that cannot be anchored.
    ///
    /// Sub-hour widths must divide 60; longer widths must be whole hours
    /// that divide a day.
    pub fn from_minutes(minutes: u32) -> Result<Self> {
        let hour_aligned = minutes > 0 && MINUTES_PER_HOUR % minutes == 0;
        let day_aligned = minutes > 0
            && minutes % MINUTES_PER_HOUR == 0
            && MINUTES_PER_DAY % minutes == 0;
        if hour_aligned || day_aligned {
            Ok(Self(minutes))
        } else {
            Err(TierError::Config(format!(
                "bucket width of {minutes} minutes cannot be anchored to hour or day boundaries"
            )))
        }
    }

    /// Width in minutes
    pub fn minutes(&self) -> u32 {
        self.0
    }

    /// Width as a duration
    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.0))
    }

    /// Exclusive end of the bucket starting at `start`
    pub fn end_of(&self, start: Timestamp) -> Timestamp {
        start + self.duration()
    }
}

impl Default for BucketWidth {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Floor `ts` to the start of its containing bucket.
pub fn bucket_of(ts: Timestamp, width: BucketWidth) -> Timestamp {
    let minute_of_day = ts.hour() * MINUTES_PER_HOUR + ts.minute();
    let offset = Duration::minutes(i64::from(minute_of_day % width.0))
        + Duration::seconds(i64::from(ts.second()))
        + Duration::nanoseconds(i64::from(ts.nanosecond()));
    ts.checked_sub_signed(offset).unwrap_or(ts)
}

/// Read-side aggregation interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregationInterval {
    OneMinute,
    FiveMinutes,
    OneHour,
    OneDay,
}

impl AggregationInterval {
    /// Bucket width this interval groups by
    pub fn width(&self) -> BucketWidth {
        match self {
            AggregationInterval::OneMinute => BucketWidth(1),
            AggregationInterval::FiveMinutes => BucketWidth(5),
            AggregationInterval::OneHour => BucketWidth(MINUTES_PER_HOUR),
            AggregationInterval::OneDay => BucketWidth(MINUTES_PER_DAY),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationInterval::OneMinute => "1m",
            AggregationInterval::FiveMinutes => "5m",
            AggregationInterval::OneHour => "1h",
            AggregationInterval::OneDay => "1d",
        }
    }
}

impl FromStr for AggregationInterval {
    type Err = TierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "1m" | "1min" | "minute" => Ok(AggregationInterval::OneMinute),
            "5m" | "5min" => Ok(AggregationInterval::FiveMinutes),
            "1h" | "hour" => Ok(AggregationInterval::OneHour),
            "1d" | "day" => Ok(AggregationInterval::OneDay),
            other => Err(TierError::InvalidInterval(format!(
                "unsupported aggregation interval '{other}', expected one of 1m, 5m, 1h, 1d"
            ))),
        }
    }
}

impl fmt::Display for AggregationInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
