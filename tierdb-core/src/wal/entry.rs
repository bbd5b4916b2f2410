//! WAL entry types and serialization

use crate::store::CompactionBatch;
use crate::{Bucket, Checkpoint, Result, Sample, SampleId, TierError, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame overhead: length prefix + type + payload length + checksum
const FRAME_OVERHEAD: usize = 4 + 1 + 4 + 4;

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    /// One raw sample appended
    AppendSample = 1,
    /// Bucket upserts together with the raw rows they replace
    Compact = 2,
    /// Compaction gate advanced
    Checkpoint = 3,
}

impl TryFrom<u8> for WalEntryType {
    type Error = TierError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::AppendSample),
            2 => Ok(WalEntryType::Compact),
            3 => Ok(WalEntryType::Checkpoint),
            _ => Err(TierError::InvalidFormat(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// Decoded WAL entry, ready to be replayed against the tables
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    AppendSample(Sample),
    Compact(CompactionBatch),
    Checkpoint(Checkpoint),
}

/// A single framed WAL entry
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// Entry type
    pub entry_type: WalEntryType,
    /// Entry payload (bincode)
    pub payload: Vec<u8>,
}

// On-disk shapes. Timestamps are nanoseconds since the epoch and the
// sample payload is carried as JSON text, since bincode cannot decode a
// self-describing `serde_json::Value`.

#[derive(Serialize, Deserialize)]
struct SampleRecord {
    id: SampleId,
    device_id: String,
    datastream_id: String,
    value: f64,
    created_at_ns: i64,
    payload_json: String,
}

#[derive(Serialize, Deserialize)]
struct BucketRecord {
    device_id: String,
    datastream_id: String,
    avg_value: f64,
    min_value: f64,
    max_value: f64,
    sample_count: u64,
    time_bucket_ns: i64,
}

#[derive(Serialize, Deserialize)]
struct CompactRecord {
    buckets: Vec<BucketRecord>,
    consumed: Vec<SampleId>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    last_check_ns: i64,
    run_id: Option<Uuid>,
}

fn to_nanos(ts: Timestamp) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| TierError::InvalidFormat(format!("timestamp out of range: {ts}")))
}

fn from_nanos(ns: i64) -> Timestamp {
    DateTime::from_timestamp_nanos(ns)
}

impl WalEntry {
    /// Entry for an appended sample
    pub fn append_sample(sample: &Sample) -> Result<Self> {
        let record = SampleRecord {
            id: sample.id,
            device_id: sample.device_id.clone(),
            datastream_id: sample.datastream_id.clone(),
            value: sample.value,
            created_at_ns: to_nanos(sample.created_at)?,
            payload_json: serde_json::to_string(&sample.payload)
                .map_err(|e| TierError::InvalidFormat(e.to_string()))?,
        };
        Self::encode(WalEntryType::AppendSample, &record)
    }

    /// Entry for an atomic compaction batch
    pub fn compact(batch: &CompactionBatch) -> Result<Self> {
        let record = CompactRecord {
            buckets: batch
                .buckets
                .iter()
                .map(|b| {
                    Ok(BucketRecord {
                        device_id: b.device_id.clone(),
                        datastream_id: b.datastream_id.clone(),
                        avg_value: b.avg_value,
                        min_value: b.min_value,
                        max_value: b.max_value,
                        sample_count: b.sample_count,
                        time_bucket_ns: to_nanos(b.time_bucket)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            consumed: batch.consumed.clone(),
        };
        Self::encode(WalEntryType::Compact, &record)
    }

    /// Entry for a checkpoint update
    pub fn checkpoint(checkpoint: &Checkpoint) -> Result<Self> {
        let record = CheckpointRecord {
            last_check_ns: to_nanos(checkpoint.last_check_time)?,
            run_id: checkpoint.run_id,
        };
        Self::encode(WalEntryType::Checkpoint, &record)
    }

    fn encode<T: Serialize>(entry_type: WalEntryType, record: &T) -> Result<Self> {
        Ok(Self {
            entry_type,
            payload: bincode::serialize(record)?,
        })
    }

    /// Decode the payload back into a replayable record
    pub fn decode(&self) -> Result<WalRecord> {
        match self.entry_type {
            WalEntryType::AppendSample => {
                let r: SampleRecord = bincode::deserialize(&self.payload)?;
                Ok(WalRecord::AppendSample(Sample {
                    id: r.id,
                    device_id: r.device_id,
                    datastream_id: r.datastream_id,
                    value: r.value,
                    created_at: from_nanos(r.created_at_ns),
                    payload: serde_json::from_str(&r.payload_json)
                        .map_err(|e| TierError::InvalidFormat(e.to_string()))?,
                }))
            }
            WalEntryType::Compact => {
                let r: CompactRecord = bincode::deserialize(&self.payload)?;
                let buckets = r
                    .buckets
                    .into_iter()
                    .map(|b| Bucket {
                        device_id: b.device_id,
                        datastream_id: b.datastream_id,
                        avg_value: b.avg_value,
                        min_value: b.min_value,
                        max_value: b.max_value,
                        sample_count: b.sample_count,
                        time_bucket: from_nanos(b.time_bucket_ns),
                    })
                    .collect();
                Ok(WalRecord::Compact(CompactionBatch {
                    buckets,
                    consumed: r.consumed,
                }))
            }
            WalEntryType::Checkpoint => {
                let r: CheckpointRecord = bincode::deserialize(&self.payload)?;
                Ok(WalRecord::Checkpoint(Checkpoint {
                    last_check_time: from_nanos(r.last_check_ns),
                    run_id: r.run_id,
                }))
            }
        }
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - 1 byte: entry type
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + self.payload.len());

        buf.put_u32_le(0);
        buf.put_u8(self.entry_type as u8);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` ends mid-frame (a torn write at the
    /// tail of a segment).
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }

        let len = (&data[..4]).get_u32_le() as usize;
        if data.len() < 4 + len {
            return Ok(None);
        }
        if len < FRAME_OVERHEAD - 4 {
            return Err(TierError::Corruption(format!("frame length {len} too short")));
        }

        let entry_data = &data[4..4 + len];
        let (body, mut trailer) = entry_data.split_at(len - 4);

        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TierError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let entry_type = WalEntryType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != payload_len {
            return Err(TierError::Corruption(format!(
                "payload length {payload_len} does not match frame ({} bytes left)",
                cursor.remaining()
            )));
        }

        let entry = WalEntry {
            entry_type,
            payload: cursor.to_vec(),
        };

        Ok(Some((entry, 4 + len)))
    }
}
