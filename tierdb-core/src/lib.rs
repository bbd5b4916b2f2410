//! TierDB Core - Tiered Time-Series Storage for Device Telemetry
//!
//! Samples land in a raw (hot) tier. A time-gated compactor folds aged raw
//! rows into fixed-width aggregate buckets in a compacted (cold) tier, and a
//! batched retention sweep keeps the raw tier bounded. Reads go through a
//! router that picks the tier(s) covering the requested range.
//!
//! # Architecture
//!
//! - **Store**: raw table, compacted table and a single-row checkpoint,
//!   behind the [`store::TierStore`] trait
//! - **WAL**: durability for the embedded store, one record per mutation
//! - **Compaction**: aggregate-and-consume batches, applied atomically
//! - **Retention**: batched cleanup of the raw tier
//! - **Query**: hot/cold/mixed classification and merge

pub mod aggregates;
pub mod bucket;
pub mod cache;
pub mod clock;
pub mod compaction;
pub mod query;
pub mod retention;
pub mod service;
pub mod settings;
pub mod store;
pub mod wal;

mod error;
mod types;

pub use error::{Result, TierError};
pub use service::{DistributionStats, MaintenanceReport, TelemetryStore, TierCounts};
pub use settings::TierConfig;
pub use types::*;

/// TierDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Compacted bucket width in minutes
    pub const BUCKET_WIDTH_MINUTES: u32 = 5;

    /// Raw rows aggregated per compaction batch
    pub const COMPACTION_BATCH_ROWS: usize = 10_000;

    /// Raw rows per retention batch
    pub const RETENTION_BATCH_SIZE: usize = 1_000;

    /// Maximum retention batches per sweep
    pub const RETENTION_MAX_BATCHES: usize = 100;

    /// Raw row count above which a cleanup is recommended
    pub const CLEANUP_THRESHOLD: u64 = 10_000;

    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
}
