//! Embedded store: in-memory tables with optional WAL durability

use super::{AppliedBatch, CompactionBatch, TierStore};
use crate::wal::{WalConfig, WalEntry, WalReader, WalRecord, WalWriter};
use crate::{
    Bucket, Checkpoint, NewSample, Result, Sample, SampleId, SeriesFilter, SeriesId, TierError,
    TimeRange, Timestamp,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tracing::{info, warn};

/// Raw rows keyed by write time, then id, so range scans come out ordered
type RawKey = (Timestamp, SampleId);

/// Buckets keyed by start time first so time-range scans stay ordered
type CompactedKey = (Timestamp, SeriesId);

#[derive(Default)]
struct Tables {
    raw: BTreeMap<RawKey, Sample>,
    raw_by_id: HashMap<SampleId, Timestamp>,
    compacted: BTreeMap<CompactedKey, Bucket>,
    checkpoint: Option<Checkpoint>,
    next_id: SampleId,
}

impl Tables {
    fn insert_raw(&mut self, sample: Sample) {
        self.next_id = self.next_id.max(sample.id + 1);
        self.raw_by_id.insert(sample.id, sample.created_at);
        self.raw.insert((sample.created_at, sample.id), sample);
    }

    fn remove_raw(&mut self, id: SampleId) -> bool {
        match self.raw_by_id.remove(&id) {
            Some(created_at) => self.raw.remove(&(created_at, id)).is_some(),
            None => false,
        }
    }

    fn merge_bucket(&mut self, bucket: &Bucket) {
        let key = (bucket.time_bucket, bucket.key().series);
        match self.compacted.get_mut(&key) {
            Some(existing) => existing.absorb(bucket),
            None => {
                self.compacted.insert(key, bucket.clone());
            }
        }
    }

    fn apply_batch(&mut self, batch: &CompactionBatch) -> AppliedBatch {
        for bucket in &batch.buckets {
            self.merge_bucket(bucket);
        }
        let rows_deleted = batch
            .consumed
            .iter()
            .filter(|id| self.remove_raw(**id))
            .count();
        AppliedBatch {
            buckets_written: batch.buckets.len(),
            rows_deleted,
        }
    }

    fn replay(&mut self, record: WalRecord) {
        match record {
            WalRecord::AppendSample(sample) => self.insert_raw(sample),
            WalRecord::Compact(batch) => {
                let applied = self.apply_batch(&batch);
                if applied.rows_deleted != batch.consumed.len() {
                    warn!(
                        "Replayed compaction consumed {} of {} raw rows",
                        applied.rows_deleted,
                        batch.consumed.len()
                    );
                }
            }
            WalRecord::Checkpoint(checkpoint) => self.checkpoint = Some(checkpoint),
        }
    }
}

/// Tiered store kept in memory, optionally backed by a write-ahead log.
///
/// All three tables sit behind one lock, which is what makes a compaction
/// batch atomic: readers see either the raw rows or the merged bucket,
/// never both and never neither.
pub struct EmbeddedStore {
    tables: RwLock<Tables>,
    wal: Option<WalWriter>,
}

impl EmbeddedStore {
    /// Volatile store, nothing survives the process
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            wal: None,
        }
    }

    /// Open a durable store, replaying any existing WAL segments
    pub fn open(wal_config: WalConfig) -> Result<Self> {
        let mut tables = Tables::default();

        let entries = WalReader::new(wal_config.clone()).recover()?;
        if !entries.is_empty() {
            info!("Replaying {} WAL entries from {:?}", entries.len(), wal_config.dir);
        }
        for entry in entries {
            tables.replay(entry.decode()?);
        }

        let wal = WalWriter::new(wal_config)?;

        Ok(Self {
            tables: RwLock::new(tables),
            wal: Some(wal),
        })
    }

    /// Whether mutations are persisted
    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    fn log(&self, entry: impl FnOnce() -> Result<WalEntry>) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.append(&entry()?)?;
        }
        Ok(())
    }
}

impl TierStore for EmbeddedStore {
    fn append_sample(&self, sample: NewSample, created_at: Timestamp) -> Result<Sample> {
        let mut tables = self.tables.write();
        let stored = Sample {
            id: tables.next_id,
            device_id: sample.device_id,
            datastream_id: sample.datastream_id,
            value: sample.value,
            created_at,
            payload: sample.payload,
        };

        self.log(|| WalEntry::append_sample(&stored))?;
        tables.insert_raw(stored.clone());

        Ok(stored)
    }

    fn raw_range(
        &self,
        filter: &SeriesFilter,
        range: TimeRange,
        limit: Option<usize>,
    ) -> Result<Vec<Sample>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read();
        let rows = tables
            .raw
            .range((
                Bound::Included((range.start, SampleId::MIN)),
                Bound::Excluded((range.end, SampleId::MIN)),
            ))
            .map(|(_, s)| s)
            .filter(|s| filter.matches(&s.device_id, &s.datastream_id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(rows)
    }

    fn compacted_range(&self, filter: &SeriesFilter, range: TimeRange) -> Result<Vec<Bucket>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read();
        let rows = tables
            .compacted
            .range((range.start, SeriesId::default())..)
            .take_while(|((ts, _), _)| *ts < range.end)
            .map(|(_, b)| b)
            .filter(|b| filter.matches(&b.device_id, &b.datastream_id))
            .cloned()
            .collect();
        Ok(rows)
    }

    fn apply_compaction(&self, batch: &CompactionBatch) -> Result<AppliedBatch> {
        if batch.is_empty() {
            return Ok(AppliedBatch::default());
        }

        let mut tables = self.tables.write();
        if let Some(missing) = batch.consumed.iter().find(|id| !tables.raw_by_id.contains_key(*id)) {
            return Err(TierError::Conflict(format!(
                "raw row {missing} was already compacted or deleted"
            )));
        }

        self.log(|| WalEntry::compact(batch))?;
        Ok(tables.apply_batch(batch))
    }

    fn checkpoint(&self) -> Result<Option<Checkpoint>> {
        Ok(self.tables.read().checkpoint.clone())
    }

    fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut tables = self.tables.write();
        self.log(|| WalEntry::checkpoint(checkpoint))?;
        tables.checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    fn count_raw(&self, since: Option<Timestamp>) -> Result<u64> {
        let tables = self.tables.read();
        let count = match since {
            Some(since) => tables.raw.range((since, SampleId::MIN)..).count(),
            None => tables.raw.len(),
        };
        Ok(count as u64)
    }

    fn count_compacted(&self, since: Option<Timestamp>) -> Result<u64> {
        let tables = self.tables.read();
        let count = match since {
            Some(since) => tables.compacted.range((since, SeriesId::default())..).count(),
            None => tables.compacted.len(),
        };
        Ok(count as u64)
    }
}
