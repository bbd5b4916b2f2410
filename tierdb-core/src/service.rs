//! Telemetry store facade
//!
//! [`TelemetryStore`] wires the tiers, the compactor, the retention sweep and
//! the reader together behind the operations the ingestion and dashboard
//! sides call. Maintenance is never scheduled: each write fires a
//! non-blocking gate check, and operators can force a run.

use crate::cache::{CacheStats, ResultCache};
use crate::clock::{Clock, SystemClock};
use crate::compaction::{CompactionGate, CompactionReport, Compactor};
use crate::query::{RangeQuery, SeriesPoint, SmartReader};
use crate::retention::{RetentionSweep, SweepReport};
use crate::settings::TierConfig;
use crate::store::{EmbeddedStore, TierStore};
use crate::{NewSample, Result, Sample, TierError, TimeRange, Timestamp};
use chrono::Duration;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Row counts of one tier by recency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierCounts {
    pub last_hour: u64,
    pub last_day: u64,
    pub last_week: u64,
    pub total: u64,
}

/// How rows are spread across the tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionStats {
    /// Raw tier
    pub original: TierCounts,
    /// Compacted tier, counted in buckets
    pub compressed: TierCounts,
    pub cleanup_threshold: u64,
    /// Raw tier holds more rows than the threshold
    pub cleanup_recommended: bool,
}

/// Result of an operator-triggered maintenance run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Raw rows folded into buckets
    pub compressed_rows: usize,
    /// Raw rows removed from the raw tier
    pub deleted_rows: usize,
    pub buckets_written: usize,
    pub batches: usize,
}

// Raw rows leave the raw tier only by being folded into a bucket, so both
// counts come from the same batches.
impl From<CompactionReport> for MaintenanceReport {
    fn from(report: CompactionReport) -> Self {
        Self {
            compressed_rows: report.rows_deleted,
            deleted_rows: report.rows_deleted,
            buckets_written: report.buckets_written,
            batches: report.batches,
        }
    }
}

impl From<SweepReport> for MaintenanceReport {
    fn from(report: SweepReport) -> Self {
        Self {
            compressed_rows: report.rows_deleted,
            deleted_rows: report.rows_deleted,
            buckets_written: report.buckets_written,
            batches: report.batches,
        }
    }
}

struct Inner {
    store: Arc<dyn TierStore>,
    clock: Arc<dyn Clock>,
    compactor: Arc<Compactor>,
    gate: CompactionGate,
    sweep: RetentionSweep,
    reader: SmartReader,
    query_cache: ResultCache<RangeQuery, Vec<SeriesPoint>>,
    stats_cache: ResultCache<(), DistributionStats>,
    retention_keep: Duration,
    cleanup_threshold: u64,
    /// Serializes compaction and retention within this process
    maintenance: Mutex<()>,
    trigger_pending: AtomicBool,
}

/// Tiered telemetry storage
#[derive(Clone)]
pub struct TelemetryStore {
    inner: Arc<Inner>,
}

impl TelemetryStore {
    /// Open a store from configuration, replaying the WAL when a data
    /// directory is set
    pub fn open(config: &TierConfig) -> Result<Self> {
        config.validate()?;
        let store = match config.wal_config() {
            Some(wal_config) => {
                info!("Opening durable store in {:?}", wal_config.dir);
                EmbeddedStore::open(wal_config)?
            }
            None => {
                info!("Opening in-memory store");
                EmbeddedStore::in_memory()
            }
        };
        Self::with_store(config, Arc::new(store), Arc::new(SystemClock))
    }

    /// Build over an existing backend and clock
    pub fn with_store(
        config: &TierConfig,
        store: Arc<dyn TierStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let compaction = config.compaction_config()?;
        let reader = SmartReader::new(
            store.clone(),
            clock.clone(),
            compaction.bucket_width,
            compaction.delay,
        );
        let compactor = Arc::new(Compactor::new(store.clone(), compaction));
        let cache_ttl = config.cache_ttl()?;

        Ok(Self {
            inner: Arc::new(Inner {
                gate: CompactionGate::new(store.clone(), clock.clone(), config.compaction_interval()?),
                sweep: RetentionSweep::new(compactor.clone(), config.retention_config()),
                reader,
                compactor,
                query_cache: ResultCache::new(cache_ttl, config.cache_capacity, clock.clone()),
                stats_cache: ResultCache::new(cache_ttl, 1, clock.clone()),
                retention_keep: config.retention_keep()?,
                cleanup_threshold: config.cleanup_threshold,
                maintenance: Mutex::new(()),
                trigger_pending: AtomicBool::new(false),
                store,
                clock,
            }),
        })
    }

    /// Store one sample stamped with the current time.
    ///
    /// Fires a background maintenance check afterwards; only the write
    /// itself can fail the call.
    pub fn append_sample(&self, sample: NewSample) -> Result<Sample> {
        if sample.device_id.is_empty() || sample.datastream_id.is_empty() {
            return Err(TierError::Config(
                "device_id and datastream_id must not be empty".into(),
            ));
        }
        if !sample.value.is_finite() {
            return Err(TierError::Config(format!(
                "sample value must be finite, got {}",
                sample.value
            )));
        }

        let stored = self.inner.store.append_sample(sample, self.inner.clock.now())?;
        self.trigger_maintenance();
        Ok(stored)
    }

    /// Range read across both tiers, served from cache when fresh
    pub fn query_range(&self, query: &RangeQuery) -> Result<Vec<SeriesPoint>> {
        query.validate()?;
        self.inner
            .query_cache
            .get_or_try_insert_with(query.clone(), || self.inner.reader.query(query))
    }

    /// Row counts per tier and recency window
    pub fn distribution_stats(&self) -> Result<DistributionStats> {
        self.inner
            .stats_cache
            .get_or_try_insert_with((), || self.compute_distribution())
    }

    fn compute_distribution(&self) -> Result<DistributionStats> {
        let now = self.inner.clock.now();
        let windows = [now - Duration::hours(1), now - Duration::days(1), now - Duration::weeks(1)];
        let store = &self.inner.store;

        let count = |f: &dyn Fn(Option<Timestamp>) -> Result<u64>| -> Result<TierCounts> {
            Ok(TierCounts {
                last_hour: f(Some(windows[0]))?,
                last_day: f(Some(windows[1]))?,
                last_week: f(Some(windows[2]))?,
                total: f(None)?,
            })
        };
        let original = count(&|since| store.count_raw(since))?;
        let compressed = count(&|since| store.count_compacted(since))?;

        Ok(DistributionStats {
            original,
            compressed,
            cleanup_threshold: self.inner.cleanup_threshold,
            cleanup_recommended: original.total > self.inner.cleanup_threshold,
        })
    }

    /// Compact everything behind the boundary now, ignoring the gate
    pub fn force_compress(&self) -> Result<MaintenanceReport> {
        let _guard = self.inner.maintenance.lock();
        let boundary = self.inner.compactor.boundary(self.inner.clock.now());
        let report = self
            .inner
            .compactor
            .compact_range(TimeRange::before(boundary))?;
        self.inner.gate.mark_compacted()?;
        if report.rows_deleted > 0 {
            self.invalidate();
        }
        Ok(report.into())
    }

    /// Sweep raw rows older than the keep window.
    ///
    /// The cutoff never passes the read boundary: hot reads only look at
    /// the raw tier.
    pub fn force_cleanup(&self) -> Result<MaintenanceReport> {
        let _guard = self.inner.maintenance.lock();
        let now = self.inner.clock.now();
        let cutoff = (now - self.inner.retention_keep).min(self.inner.compactor.boundary(now));
        let report = self.inner.sweep.cleanup_older_than(cutoff)?;
        if report.rows_deleted > 0 {
            self.invalidate();
        }
        Ok(report.into())
    }

    /// Run a gated compaction if the gate is open and no other maintenance
    /// is in flight.
    ///
    /// Returns the rows compacted, or `None` when nothing ran. A failed run
    /// leaves the gate open so the next trigger retries it.
    pub fn run_maintenance_if_due(&self) -> Result<Option<MaintenanceReport>> {
        let Some(_guard) = self.inner.maintenance.try_lock() else {
            debug!("Maintenance already running, skipping gate check");
            return Ok(None);
        };
        if !self.inner.gate.should_compact()? {
            return Ok(None);
        }

        let boundary = self.inner.compactor.boundary(self.inner.clock.now());
        let report = self.inner.compactor.compact(boundary)?;
        self.inner.gate.mark_compacted()?;
        if report.rows_deleted > 0 {
            self.invalidate();
        }
        Ok(Some(report.into()))
    }

    /// Fire-and-forget gate check off the caller's thread
    fn trigger_maintenance(&self) {
        if self.inner.trigger_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = self.clone();
        let job = move || {
            if let Err(e) = this.run_maintenance_if_due() {
                warn!("Background compaction failed: {}", e);
            }
            this.inner.trigger_pending.store(false, Ordering::Release);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                let spawned = std::thread::Builder::new()
                    .name("tierdb-maintenance".into())
                    .spawn(job);
                if let Err(e) = spawned {
                    warn!("Failed to spawn maintenance thread: {}", e);
                    self.inner.trigger_pending.store(false, Ordering::Release);
                }
            }
        }
    }

    fn invalidate(&self) {
        self.inner.query_cache.clear();
        self.inner.stats_cache.clear();
    }

    /// Current compaction boundary
    pub fn boundary(&self) -> Timestamp {
        self.inner.reader.boundary()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.query_cache.stats()
    }

    /// Underlying backend
    pub fn store(&self) -> &Arc<dyn TierStore> {
        &self.inner.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::FlakyStore;
    use chrono::{TimeZone, Utc};

    fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn no_cache() -> TierConfig {
        TierConfig {
            cache_ttl: std::time::Duration::ZERO,
            ..Default::default()
        }
    }

    fn build(config: &TierConfig, now: Timestamp) -> (TelemetryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let store = TelemetryStore::with_store(
            config,
            Arc::new(EmbeddedStore::in_memory()),
            clock.clone(),
        )
        .unwrap();
        (store, clock)
    }

    #[test]
    fn test_append_rejects_bad_samples() {
        let (store, _) = build(&no_cache(), at(10, 0));
        assert!(store.append_sample(NewSample::new("", "temp", 1.0)).is_err());
        assert!(store.append_sample(NewSample::new("dev-1", "temp", f64::NAN)).is_err());
        let sample = store.append_sample(NewSample::new("dev-1", "temp", 1.0)).unwrap();
        assert_eq!(sample.created_at, at(10, 0));
    }

    #[test]
    fn test_force_compress_twice() {
        let (store, clock) = build(&no_cache(), at(10, 7));
        for m in [7, 8, 9] {
            store
                .store()
                .append_sample(NewSample::new("dev-1", "temp", f64::from(m)), at(10, m))
                .unwrap();
        }

        clock.set(at(11, 0));
        let first = store.force_compress().unwrap();
        assert_eq!(first.compressed_rows, 3);
        assert_eq!(first.buckets_written, 1);

        let buckets_before = store
            .store()
            .compacted_range(&crate::SeriesFilter::all(), TimeRange::before(at(12, 0)))
            .unwrap();

        let second = store.force_compress().unwrap();
        assert_eq!(second.compressed_rows, 0);
        let buckets_after = store
            .store()
            .compacted_range(&crate::SeriesFilter::all(), TimeRange::before(at(12, 0)))
            .unwrap();
        assert_eq!(buckets_before, buckets_after);
    }

    #[test]
    fn test_gated_maintenance() {
        let (store, clock) = build(&no_cache(), at(10, 0));
        store.store().append_sample(NewSample::new("dev-1", "temp", 1.0), at(10, 0)).unwrap();

        clock.set(at(10, 30));
        let report = store.run_maintenance_if_due().unwrap().unwrap();
        assert_eq!(report.compressed_rows, 1);

        // Gate closed until the interval elapses
        assert!(store.run_maintenance_if_due().unwrap().is_none());
        clock.advance(Duration::minutes(30));
        assert!(store.run_maintenance_if_due().unwrap().is_some());
    }

    #[test]
    fn test_failed_maintenance_keeps_gate_open() {
        let flaky = Arc::new(FlakyStore::new());
        let clock = Arc::new(ManualClock::new(at(10, 0)));
        let store = TelemetryStore::with_store(&no_cache(), flaky.clone(), clock.clone()).unwrap();
        flaky.inner.append_sample(NewSample::new("dev-1", "temp", 1.0), at(10, 0)).unwrap();

        flaky.faults.fail_compaction.store(true, std::sync::atomic::Ordering::SeqCst);
        clock.set(at(10, 30));
        assert!(store.run_maintenance_if_due().is_err());
        assert!(flaky.checkpoint().unwrap().is_none());
        assert_eq!(flaky.count_raw(None).unwrap(), 1);

        flaky.faults.fail_compaction.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(store.run_maintenance_if_due().unwrap().is_some());
        assert!(flaky.checkpoint().unwrap().is_some());
    }

    #[test]
    fn test_write_survives_maintenance_failure() {
        let flaky = Arc::new(FlakyStore::new());
        let clock = Arc::new(ManualClock::new(at(10, 0)));
        let store = TelemetryStore::with_store(&no_cache(), flaky.clone(), clock).unwrap();
        flaky.faults.fail_compaction.store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(store.append_sample(NewSample::new("dev-1", "temp", 1.0)).is_ok());

        flaky.faults.fail_appends.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(store.append_sample(NewSample::new("dev-1", "temp", 2.0)).is_err());
    }

    #[test]
    fn test_distribution_stats() {
        let (store, clock) = build(&no_cache(), at(10, 0));
        store.store().append_sample(NewSample::new("dev-1", "temp", 1.0), at(8, 0)).unwrap();
        store.store().append_sample(NewSample::new("dev-1", "temp", 2.0), at(9, 50)).unwrap();
        store.store().append_sample(NewSample::new("dev-1", "temp", 3.0), at(9, 55)).unwrap();

        let stats = store.distribution_stats().unwrap();
        assert_eq!(stats.original.last_hour, 2);
        assert_eq!(stats.original.total, 3);
        assert_eq!(stats.compressed.total, 0);
        assert!(!stats.cleanup_recommended);

        clock.set(at(12, 0));
        store.force_cleanup().unwrap();
        let stats = store.distribution_stats().unwrap();
        assert_eq!(stats.original.total, 0);
        assert_eq!(stats.compressed.total, 3);
        assert_eq!(stats.compressed.last_day, 3);
    }

    #[test]
    fn test_keep_window_shorter_than_delay_is_rejected() {
        let config = TierConfig {
            retention_keep: std::time::Duration::from_secs(60),
            ..no_cache()
        };
        let err = TelemetryStore::with_store(
            &config,
            Arc::new(EmbeddedStore::in_memory()),
            Arc::new(ManualClock::new(at(10, 0))),
        )
        .err()
        .unwrap();
        assert!(err.is_validation());
    }

    #[test]
    fn test_cleanup_never_hides_hot_rows() {
        let config = TierConfig {
            retention_keep: std::time::Duration::from_secs(15 * 60),
            ..no_cache()
        };
        let (store, clock) = build(&config, at(10, 0));
        store.store().append_sample(NewSample::new("dev-1", "temp", 5.0), at(10, 0)).unwrap();
        let query = RangeQuery::new(vec!["dev-1".into()], "temp", at(9, 59), at(10, 6));

        for now in [at(10, 5), at(10, 14), at(10, 16), at(10, 30)] {
            clock.set(now);
            store.force_cleanup().unwrap();
            let points = store.query_range(&query).unwrap();
            assert_eq!(
                points.iter().map(|p| p.sample_count).sum::<u64>(),
                1,
                "sample missing after cleanup at {now}"
            );
        }
        assert_eq!(store.store().count_raw(None).unwrap(), 0);
    }

    #[test]
    fn test_read_between_gate_ticks_sees_every_sample() {
        let (store, clock) = build(&no_cache(), at(9, 40));
        for (h, m) in [(9, 40), (9, 55), (10, 5)] {
            store
                .store()
                .append_sample(NewSample::new("dev-1", "temp", 1.0), at(h, m))
                .unwrap();
        }

        clock.set(at(10, 0));
        let report = store.run_maintenance_if_due().unwrap().unwrap();
        assert_eq!(report.compressed_rows, 1);

        // Boundary has moved to 10:15, the gate stays shut until 10:30
        clock.set(at(10, 25));
        assert!(store.run_maintenance_if_due().unwrap().is_none());
        let query = RangeQuery::new(vec!["dev-1".into()], "temp", at(9, 0), at(10, 30));
        let points = store.query_range(&query).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points.iter().map(|p| p.sample_count).sum::<u64>(), 3);
    }

    #[test]
    fn test_query_cache_invalidated_by_maintenance() {
        let (store, clock) = build(&TierConfig::default(), at(10, 0));
        store.store().append_sample(NewSample::new("dev-1", "temp", 4.0), at(10, 1)).unwrap();
        store.store().append_sample(NewSample::new("dev-1", "temp", 6.0), at(10, 2)).unwrap();

        let query = RangeQuery::new(vec!["dev-1".into()], "temp", at(10, 0), at(10, 5));
        assert_eq!(store.query_range(&query).unwrap().len(), 2);
        assert_eq!(store.query_range(&query).unwrap().len(), 2);
        assert_eq!(store.cache_stats().hits, 1);

        clock.set(at(10, 20));
        store.force_compress().unwrap();
        let points = store.query_range(&query).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].sample_count, 2);
    }

    #[tokio::test]
    async fn test_append_triggers_background_compaction() {
        let (store, clock) = build(&no_cache(), at(10, 0));
        store.store().append_sample(NewSample::new("dev-1", "temp", 1.0), at(9, 0)).unwrap();

        clock.set(at(9, 50));
        store.append_sample(NewSample::new("dev-1", "temp", 2.0)).unwrap();

        let mut compacted = false;
        for _ in 0..200 {
            if store.store().checkpoint().unwrap().is_some() {
                compacted = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(compacted, "background compaction never ran");
        assert_eq!(store.store().count_compacted(None).unwrap(), 1);
        assert_eq!(store.store().count_raw(None).unwrap(), 1);
    }
}
