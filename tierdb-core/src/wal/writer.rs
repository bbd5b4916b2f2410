//! WAL writer implementation

use super::{SyncPolicy, WalConfig, WalEntry};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// WAL writer for appending entries to disk
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: usize,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Open the WAL directory and continue in a fresh segment.
    ///
    /// Starting a new segment keeps a torn tail left by a crash isolated in
    /// the previous file, where recovery can stop at it.
    pub fn new(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let segment_id = segment_ids(&config.dir)?.last().map_or(0, |id| id + 1);
        let file = Self::open_segment(&config.dir, segment_id)?;

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            segment_id,
            bytes_written: 0,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Append an entry to the WAL. Returns once the entry is handed to the
    /// OS, and synced if the policy demands it.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let serialized = entry.serialize_with_checksum();
        let mut inner = self.inner.lock();

        if inner.bytes_written > 0
            && inner.bytes_written + serialized.len() > self.config.segment_size
        {
            self.rotate_segment(&mut inner)?;
        }

        inner.file.write_all(&serialized)?;
        inner.bytes_written += serialized.len();
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_inner(&mut inner)?;
        } else {
            inner.file.flush()?;
        }

        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_inner(&mut inner)
    }

    /// Get current segment ID
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    fn sync_inner(inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<()> {
        Self::sync_inner(inner)?;

        inner.segment_id += 1;
        let file = Self::open_segment(&self.config.dir, inner.segment_id)?;
        inner.file = BufWriter::new(file);
        inner.bytes_written = 0;

        Ok(())
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, segment_id))?;
        Ok(file)
    }
}

pub(super) fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", segment_id))
}

pub(super) fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// Segment ids present in `dir`, ascending
pub(super) fn segment_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            if let Some(id) = parse_segment_id(&entry?.path()) {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}
