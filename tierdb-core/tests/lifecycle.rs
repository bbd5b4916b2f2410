//! End-to-end lifecycle: ingest, compact, read across tiers, sweep

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tierdb_core::bucket::{bucket_of, BucketWidth};
use tierdb_core::clock::ManualClock;
use tierdb_core::compaction::{CompactionConfig, Compactor};
use tierdb_core::query::{PointSource, RangeQuery};
use tierdb_core::retention::{RetentionConfig, RetentionSweep};
use tierdb_core::store::{EmbeddedStore, TierStore};
use tierdb_core::{NewSample, SeriesFilter, TelemetryStore, TierConfig, TimeRange, Timestamp};

fn at(h: u32, m: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
}

fn quiet_config() -> TierConfig {
    TierConfig {
        cache_ttl: std::time::Duration::ZERO,
        ..Default::default()
    }
}

/// Samples at :07, :08, :09 and :12 of hour 10
fn seed(store: &dyn TierStore) {
    for (m, v) in [(7, 1.0), (8, 2.0), (9, 6.0), (12, 10.0)] {
        store
            .append_sample(NewSample::new("dev-1", "temp", v), at(10, m))
            .unwrap();
    }
}

#[test]
fn bucket_assignment() {
    let width = BucketWidth::DEFAULT;
    for m in [7, 8, 9] {
        assert_eq!(bucket_of(at(10, m), width), at(10, 5));
    }
    assert_eq!(bucket_of(at(10, 12), width), at(10, 10));
}

#[test]
fn compaction_produces_one_bucket_per_interval() {
    let store = Arc::new(EmbeddedStore::in_memory());
    seed(store.as_ref());

    let compactor = Compactor::new(store.clone(), CompactionConfig::default());
    let report = compactor
        .compact_range(TimeRange::new(at(10, 5), at(10, 10)))
        .unwrap();
    assert_eq!(report.rows_deleted, 3);
    assert_eq!(report.buckets_written, 1);

    let buckets = store
        .compacted_range(&SeriesFilter::all(), TimeRange::before(at(11, 0)))
        .unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].time_bucket, at(10, 5));
    assert_eq!(buckets[0].sample_count, 3);
    assert!((buckets[0].avg_value - 3.0).abs() < 1e-9);
    assert_eq!(buckets[0].min_value, 1.0);
    assert_eq!(buckets[0].max_value, 6.0);

    // The :12 sample was outside the window and is untouched
    assert_eq!(store.count_raw(None).unwrap(), 1);
}

#[test]
fn mixed_query_merges_tiers_in_order() {
    let clock = Arc::new(ManualClock::new(at(10, 20)));
    let backend = Arc::new(EmbeddedStore::in_memory());
    seed(backend.as_ref());
    let store = TelemetryStore::with_store(&quiet_config(), backend, clock.clone()).unwrap();

    assert_eq!(store.boundary(), at(10, 10));
    store.force_compress().unwrap();

    let query = RangeQuery::new(vec!["dev-1".into()], "temp", at(10, 0), at(10, 20));
    let points = store.query_range(&query).unwrap();

    assert_eq!(points.len(), 2);
    assert_eq!(points[0].timestamp, at(10, 5));
    assert_eq!(points[0].source, PointSource::Compacted);
    assert_eq!(points[0].sample_count, 3);
    assert_eq!(points[1].timestamp, at(10, 12));
    assert_eq!(points[1].source, PointSource::Raw);
}

#[test]
fn reads_between_gate_ticks_return_every_sample() {
    let clock = Arc::new(ManualClock::new(at(9, 0)));
    let backend = Arc::new(EmbeddedStore::in_memory());
    for (device, h, m) in [("a", 9, 10), ("a", 9, 40), ("b", 9, 55), ("a", 10, 5)] {
        backend
            .append_sample(NewSample::new(device, "temp", 1.0), at(h, m))
            .unwrap();
    }
    let store = TelemetryStore::with_store(&quiet_config(), backend.clone(), clock.clone()).unwrap();

    clock.set(at(10, 0));
    store.run_maintenance_if_due().unwrap().unwrap();
    assert_eq!(backend.count_raw(None).unwrap(), 2);

    // Gate is shut until 10:30 while the boundary keeps moving
    let query = RangeQuery::new(vec!["a".into(), "b".into()], "temp", at(9, 0), at(10, 30));
    for now in [at(10, 10), at(10, 25)] {
        clock.set(now);
        let points = store.query_range(&query).unwrap();
        assert_eq!(points.iter().map(|p| p.sample_count).sum::<u64>(), 4, "at {now}");
        assert!(points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}

#[test]
fn force_compress_is_idempotent() {
    let clock = Arc::new(ManualClock::new(at(11, 0)));
    let backend = Arc::new(EmbeddedStore::in_memory());
    seed(backend.as_ref());
    let store = TelemetryStore::with_store(&quiet_config(), backend.clone(), clock).unwrap();

    let first = store.force_compress().unwrap();
    assert_eq!(first.compressed_rows, 4);
    let buckets = backend
        .compacted_range(&SeriesFilter::all(), TimeRange::before(at(12, 0)))
        .unwrap();

    let second = store.force_compress().unwrap();
    assert_eq!(second.compressed_rows, 0);
    assert_eq!(
        backend
            .compacted_range(&SeriesFilter::all(), TimeRange::before(at(12, 0)))
            .unwrap(),
        buckets
    );
}

#[test]
fn cleanup_sweeps_in_batches() {
    let now = at(12, 0);
    let store = Arc::new(EmbeddedStore::in_memory());
    for i in 0..5000 {
        let ts = at(9, 0) + Duration::milliseconds(i * 500);
        store
            .append_sample(NewSample::new(format!("dev-{}", i % 4), "temp", i as f64), ts)
            .unwrap();
    }
    // Recent rows survive
    store
        .append_sample(NewSample::new("dev-0", "temp", 1.0), now - Duration::minutes(5))
        .unwrap();

    let compactor = Arc::new(Compactor::new(store.clone(), CompactionConfig::default()));
    let sweep = RetentionSweep::new(
        compactor,
        RetentionConfig {
            batch_size: 1000,
            ..Default::default()
        },
    );

    let report = sweep.cleanup_older_than(now - Duration::hours(1)).unwrap();
    assert_eq!(report.rows_deleted, 5000);
    assert_eq!(report.batches, 5);
    assert!(report.complete);
    assert_eq!(store.count_raw(None).unwrap(), 1);

    // Nothing was lost: the buckets account for every swept row
    let buckets = store
        .compacted_range(&SeriesFilter::all(), TimeRange::before(now))
        .unwrap();
    assert_eq!(buckets.iter().map(|b| b.sample_count).sum::<u64>(), 5000);
}

#[test]
fn durable_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = TierConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..quiet_config()
    };

    {
        let store = TelemetryStore::open(&config).unwrap();
        for v in [1.0, 2.0, 3.0] {
            store
                .append_sample(NewSample::new("dev-1", "temp", v))
                .unwrap();
        }
        assert_eq!(store.distribution_stats().unwrap().original.total, 3);
    }

    let reopened = TelemetryStore::open(&config).unwrap();
    let stats = reopened.distribution_stats().unwrap();
    assert_eq!(stats.original.total, 3);
    assert_eq!(stats.original.last_hour, 3);
}
