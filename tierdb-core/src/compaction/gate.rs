//! Time-based compaction gate
//!
//! Not a lock: two callers can both see the gate open before either marks
//! it. Compaction batches consume raw rows atomically, so the loser of such
//! a race finds nothing left (or gets a `Conflict`) instead of double
//! counting.

use crate::clock::Clock;
use crate::store::TierStore;
use crate::{Checkpoint, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Decides whether a compaction attempt is due
pub struct CompactionGate {
    store: Arc<dyn TierStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl CompactionGate {
    pub fn new(store: Arc<dyn TierStore>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            store,
            clock,
            interval,
        }
    }

    /// True if no checkpoint exists yet or the last one is at least one
    /// interval old
    pub fn should_compact(&self) -> Result<bool> {
        let now = self.clock.now();
        let due = match self.store.checkpoint()? {
            None => true,
            Some(checkpoint) => now - checkpoint.last_check_time >= self.interval,
        };
        debug!("Compaction gate at {}: due={}", now, due);
        Ok(due)
    }

    /// Advance the checkpoint to now, whether or not the run compacted anything
    pub fn mark_compacted(&self) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            last_check_time: self.clock.now(),
            run_id: Some(Uuid::new_v4()),
        };
        self.store.store_checkpoint(&checkpoint)?;
        Ok(checkpoint)
    }
}
