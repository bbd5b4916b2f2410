//! File-based configuration
//!
//! ```toml
//! bucket_width_minutes = 5
//! compaction_delay = "10m"
//! compaction_interval = "30m"
//! retention_keep = "1h"
//! data_dir = "/var/lib/tierdb"
//! ```

use crate::bucket::BucketWidth;
use crate::compaction::CompactionConfig;
use crate::retention::RetentionConfig;
use crate::wal::{SyncPolicy, WalConfig};
use crate::{Result, TierError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Store configuration, every key optional
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierConfig {
    pub bucket_width_minutes: u32,
    #[serde(with = "humantime_serde")]
    pub compaction_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub compaction_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub compaction_lookback: Duration,
    pub compaction_batch_rows: usize,
    #[serde(with = "humantime_serde")]
    pub retention_keep: Duration,
    pub retention_batch_size: usize,
    pub retention_max_batches: usize,
    #[serde(with = "humantime_serde")]
    pub batch_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Raw row count above which a cleanup is recommended
    pub cleanup_threshold: u64,
    pub wal_sync: SyncPolicy,
    /// WAL directory; in-memory only when unset
    pub data_dir: Option<PathBuf>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            bucket_width_minutes: crate::config::BUCKET_WIDTH_MINUTES,
            compaction_delay: Duration::from_secs(10 * 60),
            compaction_interval: Duration::from_secs(30 * 60),
            compaction_lookback: Duration::from_secs(60 * 60),
            compaction_batch_rows: crate::config::COMPACTION_BATCH_ROWS,
            retention_keep: Duration::from_secs(60 * 60),
            retention_batch_size: crate::config::RETENTION_BATCH_SIZE,
            retention_max_batches: crate::config::RETENTION_MAX_BATCHES,
            batch_deadline: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 256,
            cleanup_threshold: crate::config::CLEANUP_THRESHOLD,
            wal_sync: SyncPolicy::default(),
            data_dir: None,
        }
    }
}

fn chrono_duration(name: &str, value: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(value)
        .map_err(|_| TierError::Config(format!("{name} is out of range: {value:?}")))
}

impl TierConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| TierError::Config(format!("invalid settings: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            TierError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        let width = BucketWidth::from_minutes(self.bucket_width_minutes)?;
        if self.compaction_interval.is_zero() {
            return Err(TierError::Config("compaction_interval must be positive".into()));
        }
        if self.compaction_lookback.is_zero() {
            return Err(TierError::Config("compaction_lookback must be positive".into()));
        }
        for (name, value) in [
            ("compaction_batch_rows", self.compaction_batch_rows),
            ("retention_batch_size", self.retention_batch_size),
            ("retention_max_batches", self.retention_max_batches),
        ] {
            if value == 0 {
                return Err(TierError::Config(format!("{name} must be positive")));
            }
        }
        if self.batch_deadline.is_zero() {
            return Err(TierError::Config("batch_deadline must be positive".into()));
        }
        let delay = chrono_duration("compaction_delay", self.compaction_delay)?;
        let keep = chrono_duration("retention_keep", self.retention_keep)?;
        chrono_duration("cache_ttl", self.cache_ttl)?;
        // A shorter keep window would sweep rows the reader still serves from raw
        if keep < delay + width.duration() {
            return Err(TierError::Config(format!(
                "retention_keep {:?} must cover compaction_delay plus one bucket ({:?} + {}m)",
                self.retention_keep,
                self.compaction_delay,
                width.minutes()
            )));
        }
        Ok(())
    }

    pub fn bucket_width(&self) -> Result<BucketWidth> {
        BucketWidth::from_minutes(self.bucket_width_minutes)
    }

    pub fn compaction_config(&self) -> Result<CompactionConfig> {
        Ok(CompactionConfig {
            bucket_width: self.bucket_width()?,
            delay: chrono_duration("compaction_delay", self.compaction_delay)?,
            lookback: chrono_duration("compaction_lookback", self.compaction_lookback)?,
            batch_rows: self.compaction_batch_rows,
            batch_deadline: self.batch_deadline,
        })
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            batch_size: self.retention_batch_size,
            max_batches: self.retention_max_batches,
            batch_deadline: self.batch_deadline,
        }
    }

    pub fn compaction_interval(&self) -> Result<chrono::Duration> {
        chrono_duration("compaction_interval", self.compaction_interval)
    }

    pub fn retention_keep(&self) -> Result<chrono::Duration> {
        chrono_duration("retention_keep", self.retention_keep)
    }

    pub fn cache_ttl(&self) -> Result<chrono::Duration> {
        chrono_duration("cache_ttl", self.cache_ttl)
    }

    /// WAL settings, if a data directory is configured
    pub fn wal_config(&self) -> Option<WalConfig> {
        self.data_dir.as_ref().map(|dir| WalConfig {
            dir: dir.join("wal"),
            sync_policy: self.wal_sync,
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = TierConfig::from_toml_str("").unwrap();
        assert_eq!(config, TierConfig::default());
        assert_eq!(config.bucket_width().unwrap(), BucketWidth::DEFAULT);
        assert!(config.wal_config().is_none());
    }

    #[test]
    fn test_parse_durations_and_policy() {
        let config = TierConfig::from_toml_str(
            r#"
            bucket_width_minutes = 15
            compaction_delay = "2m"
            compaction_interval = "1h 30m"
            retention_keep = "7days"
            cache_ttl = "0s"
            wal_sync = { every_n = 64 }
            data_dir = "/tmp/tierdb"
            "#,
        )
        .unwrap();

        assert_eq!(config.compaction_delay, Duration::from_secs(120));
        assert_eq!(config.compaction_interval, Duration::from_secs(90 * 60));
        assert_eq!(config.retention_keep().unwrap(), chrono::Duration::days(7));
        assert!(config.cache_ttl.is_zero());

        let wal = config.wal_config().unwrap();
        assert_eq!(wal.dir, PathBuf::from("/tmp/tierdb/wal"));
        assert_eq!(wal.sync_policy, SyncPolicy::EveryN(64));

        let compaction = config.compaction_config().unwrap();
        assert_eq!(compaction.bucket_width.minutes(), 15);
        assert_eq!(compaction.delay, chrono::Duration::minutes(2));
    }

    #[test]
    fn test_rejects_bad_values() {
        for source in [
            "bucket_width_minutes = 7",
            "bucket_width_minutes = 0",
            "retention_batch_size = 0",
            r#"compaction_interval = "0s""#,
            r#"compaction_delay = "ten minutes""#,
            r#"retention_keep = "60s""#,
            r#"retention_keep = "14m""#,
            "unknown_key = 1",
        ] {
            let err = TierConfig::from_toml_str(source).unwrap_err();
            assert!(err.is_validation(), "{source}: {err}");
        }
    }

    #[test]
    fn test_keep_window_may_equal_delay_plus_bucket() {
        let config = TierConfig::from_toml_str(
            r#"
            compaction_delay = "10m"
            retention_keep = "15m"
            "#,
        )
        .unwrap();
        assert_eq!(config.retention_keep().unwrap(), chrono::Duration::minutes(15));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tierdb.toml");
        std::fs::write(&path, "retention_batch_size = 500\n").unwrap();

        let config = TierConfig::load(&path).unwrap();
        assert_eq!(config.retention_config().batch_size, 500);

        assert!(TierConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
