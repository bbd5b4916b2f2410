//! Tier storage
//!
//! [`TierStore`] is the seam between the maintenance/read logic and the
//! backend holding the three tables: raw samples (hot tier), compacted
//! buckets (cold tier) and the single-row compaction checkpoint.

mod embedded;

pub use embedded::EmbeddedStore;

use crate::{
    Bucket, Checkpoint, NewSample, Result, Sample, SampleId, SeriesFilter, TimeRange, Timestamp,
};

/// Bucket upserts together with the raw rows they were aggregated from.
///
/// Applied atomically: either every bucket is merged and every consumed row
/// deleted, or nothing changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionBatch {
    pub buckets: Vec<Bucket>,
    pub consumed: Vec<SampleId>,
}

impl CompactionBatch {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.consumed.is_empty()
    }
}

/// What a committed compaction batch changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Buckets inserted or merged into
    pub buckets_written: usize,
    /// Raw rows removed
    pub rows_deleted: usize,
}

/// Backend holding the raw tier, compacted tier and checkpoint
pub trait TierStore: Send + Sync {
    /// Persist one raw sample with the given write time
    fn append_sample(&self, sample: NewSample, created_at: Timestamp) -> Result<Sample>;

    /// Raw rows in `range`, ascending by `created_at`, at most `limit` oldest rows
    fn raw_range(
        &self,
        filter: &SeriesFilter,
        range: TimeRange,
        limit: Option<usize>,
    ) -> Result<Vec<Sample>>;

    /// Buckets whose `time_bucket` falls in `range`, ascending by `time_bucket`
    fn compacted_range(&self, filter: &SeriesFilter, range: TimeRange) -> Result<Vec<Bucket>>;

    /// Atomically merge `batch.buckets` and delete `batch.consumed`.
    ///
    /// Fails with `Conflict`, changing nothing, if any consumed row is
    /// already gone.
    fn apply_compaction(&self, batch: &CompactionBatch) -> Result<AppliedBatch>;

    /// Current checkpoint, if one was ever written
    fn checkpoint(&self) -> Result<Option<Checkpoint>>;

    /// Overwrite the checkpoint row
    fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Raw rows created at or after `since` (all rows if `None`)
    fn count_raw(&self, since: Option<Timestamp>) -> Result<u64>;

    /// Buckets starting at or after `since` (all buckets if `None`)
    fn count_compacted(&self, since: Option<Timestamp>) -> Result<u64>;
}
