//! WAL reader for recovery

use super::writer::segment_ids;
use super::writer::segment_path;
use super::{WalConfig, WalEntry};
use crate::{Result, TierError};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// WAL reader for recovering entries after crash
pub struct WalReader {
    config: WalConfig,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(config: WalConfig) -> Self {
        Self { config }
    }

    /// Recover all entries from WAL segments, oldest first
    pub fn recover(&self) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();

        for segment_id in segment_ids(&self.config.dir)? {
            let path = segment_path(&self.config.dir, segment_id);
            let segment_entries = self.read_segment(&path)?;
            if !segment_entries.is_empty() {
                info!(
                    "Recovered {} entries from {:?}",
                    segment_entries.len(),
                    path
                );
            }
            entries.extend(segment_entries);
        }

        Ok(entries)
    }

    fn read_segment(&self, path: &Path) -> Result<Vec<WalEntry>> {
        let data = fs::read(path)?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok(Some((entry, bytes_read))) => {
                    entries.push(entry);
                    offset += bytes_read;
                }
                Ok(None) => {
                    warn!(
                        "Incomplete entry at offset {} in {:?}, ignoring tail",
                        offset, path
                    );
                    break;
                }
                Err(e @ (TierError::ChecksumMismatch { .. } | TierError::Corruption(_))) => {
                    warn!("{} at offset {} in {:?}, truncating", e, offset, path);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(entries)
    }
}
