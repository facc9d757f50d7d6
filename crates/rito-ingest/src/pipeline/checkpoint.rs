//! Cursor checkpointing.
//!
//! The driver reports each finished event here. The highest finished
//! position is kept in memory and written to the [`CursorStore`] on a fixed
//! interval and on shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use rito_core::JETSTREAM_SERVICE;

use crate::Result;
use crate::store::{CursorStore, IndexStore};

#[derive(Debug, Clone, Copy)]
pub struct CheckpointConfig {
    /// Row in `jetstream_index` this checkpointer owns.
    pub service: &'static str,
    /// How often the committed cursor is persisted.
    pub interval: Duration,
    /// Tombstones older than this (relative to the cursor) are pruned on
    /// checkpoint. `None` keeps them forever.
    pub tombstone_retention: Option<Duration>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            service: JETSTREAM_SERVICE,
            interval: Duration::from_secs(5),
            tombstone_retention: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

pub struct Checkpointer {
    cursors: CursorStore,
    index: Arc<IndexStore>,
    config: CheckpointConfig,
    /// Highest position whose event finished processing.
    committed: Option<i64>,
    /// Highest position written to the store.
    flushed: Option<i64>,
    last_flush: Instant,
}

impl Checkpointer {
    /// Start from whatever the store already holds.
    pub fn load(
        cursors: CursorStore,
        index: Arc<IndexStore>,
        config: CheckpointConfig,
    ) -> Result<Self> {
        let stored = cursors.get(config.service)?;
        if let Some(cursor) = stored {
            gauge!("cursor_position_micros").set(cursor as f64);
        }
        Ok(Self {
            cursors,
            index,
            config,
            committed: stored,
            flushed: stored,
            last_flush: Instant::now(),
        })
    }

    /// Position to resume from: the last finished event.
    pub fn committed(&self) -> Option<i64> {
        self.committed
    }

    /// Record that the event at `time_us` finished. Never moves backwards.
    pub fn advance(&mut self, time_us: i64) {
        self.committed = Some(self.committed.map_or(time_us, |c| c.max(time_us)));
    }

    /// Flush if the interval has elapsed. Returns whether a write happened.
    pub fn maybe_flush(&mut self) -> Result<bool> {
        if self.last_flush.elapsed() < self.config.interval {
            return Ok(false);
        }
        self.flush()
    }

    /// Write the committed cursor now. Returns whether a write happened.
    pub fn flush(&mut self) -> Result<bool> {
        self.last_flush = Instant::now();

        let Some(cursor) = self.committed else {
            return Ok(false);
        };
        if self.flushed == Some(cursor) {
            return Ok(false);
        }

        self.cursors.checkpoint(self.config.service, cursor)?;
        self.flushed = Some(cursor);

        counter!("cursor_checkpoints_total").increment(1);
        gauge!("cursor_position_micros").set(cursor as f64);
        let lag_secs = (chrono::Utc::now().timestamp_micros() - cursor) as f64 / 1_000_000.0;
        gauge!("cursor_lag_seconds").set(lag_secs.max(0.0));
        tracing::debug!(cursor, "checkpointed cursor");

        if let Some(retention) = self.config.tombstone_retention {
            let before = cursor - retention.as_micros() as i64;
            let pruned = self.index.prune_tombstones(before)?;
            if pruned > 0 {
                counter!("store_tombstones_pruned_total").increment(pruned as u64);
                tracing::debug!(pruned, "pruned tombstones");
            }
        }

        Ok(true)
    }
}
