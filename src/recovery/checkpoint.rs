//! Checkpointing.
//!
//! A checkpoint records the highest log position below which every
//! transaction is reflected in the store files. Store files are flushed and
//! forced first, so everything at or below that position survives a crash
//! without replay.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use crate::storage::buffer::PageCache;
use crate::storage::error::StorageResult;
use crate::storage::meta::{StoreId, StoreMeta};
use crate::storage::wal::{CheckpointMarker, LogPosition, WalManager};
use crate::transaction::AppliedPositions;

/// What a checkpoint wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOutcome {
    /// Position of the checkpoint record itself.
    pub record_position: LogPosition,
    /// Every transaction at or below this position is in the store files.
    pub applied_position: LogPosition,
    /// Log bytes dropped by compaction, when it ran.
    pub compacted_bytes: Option<u64>,
}

/// Flushes the cache, appends and forces a checkpoint record, then persists
/// the marker in `store.meta`.
pub(crate) fn write_checkpoint(
    wal: &WalManager,
    cache: &PageCache,
    store_dir: &Path,
    applied_position: LogPosition,
    last_tx_id: u64,
) -> StorageResult<LogPosition> {
    cache.flush_all()?;
    let record_position = wal.append_checkpoint(CheckpointMarker {
        applied_position,
        last_tx_id,
    })?;
    wal.force(record_position)?;

    StoreMeta {
        store_id: wal.store_id(),
        checkpoint_position: applied_position,
        last_tx_id,
    }
    .store(store_dir)?;
    Ok(record_position)
}

/// Runs checkpoints on a live store. One checkpoint runs at a time.
pub struct Checkpointer {
    wal: Arc<WalManager>,
    cache: PageCache,
    applied: Arc<AppliedPositions>,
    store_dir: PathBuf,
    compact_log: bool,
    running: Mutex<()>,
}

impl Checkpointer {
    pub fn new(
        wal: Arc<WalManager>,
        cache: PageCache,
        applied: Arc<AppliedPositions>,
        store_dir: impl Into<PathBuf>,
        compact_log: bool,
    ) -> Self {
        Self {
            wal,
            cache,
            applied,
            store_dir: store_dir.into(),
            compact_log,
            running: Mutex::new(()),
        }
    }

    pub fn store_id(&self) -> StoreId {
        self.wal.store_id()
    }

    /// Checkpoints the store. `last_tx_id` is the newest transaction id issued
    /// so far, recorded so ids are never reused after a restart.
    pub fn checkpoint(&self, last_tx_id: u64) -> StorageResult<CheckpointOutcome> {
        let _running = self.running.lock();

        // Taken before the flush: anything applied later may miss it.
        let applied_position = self.applied.contiguous();
        let record_position = write_checkpoint(
            &self.wal,
            &self.cache,
            &self.store_dir,
            applied_position,
            last_tx_id,
        )?;
        self.applied.mark_applied(record_position);

        // Records after the applied position may belong to commits still in
        // flight, so they are kept.
        let compacted_bytes = if self.compact_log {
            Some(self.wal.compact(applied_position.next())?)
        } else {
            None
        };

        info!(
            "checkpoint at {} covers {}",
            record_position, applied_position
        );
        Ok(CheckpointOutcome {
            record_position,
            applied_position,
            compacted_bytes,
        })
    }
}
