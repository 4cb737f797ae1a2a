//! Startup recovery.
//!
//! Recovery runs once when a store opens, before any commit:
//! 1. Scanning: read the log, find the checkpoint and the valid end
//! 2. Replaying: reapply every transaction after the checkpoint
//! 3. Clean: flush, checkpoint, and hand the log over to new commits
//!
//! Replay goes through the same [`StoreApplier`] as normal commits. Commands
//! are absolute, so replaying a transaction that already reached the store
//! leaves it unchanged.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use super::checkpoint::write_checkpoint;
use crate::storage::error::StorageError;
use crate::storage::meta::StoreMeta;
use crate::storage::wal::{LogPosition, RecordBody, WalManager};
use crate::transaction::{decode_batch, StoreApplier, TransactionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Unrecovered,
    Scanning,
    Replaying,
    Clean,
}

#[derive(Error, Debug)]
pub enum RecoveryError {
    /// The log is damaged at or before a position the store already relies on.
    #[error("log is unrecoverable: valid records end at {last_valid} but the store checkpoint is at {checkpoint}: {reason}")]
    UnrecoverableLog {
        checkpoint: LogPosition,
        last_valid: LogPosition,
        reason: String,
    },

    /// A read-only store found committed transactions it cannot replay.
    #[error("{pending} logged transactions are not applied; open the store read-write to recover")]
    RecoveryRequired { pending: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// What recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub transactions_replayed: usize,
    /// Checkpoint replay started after.
    pub checkpoint_position: LogPosition,
    /// Last log position once recovery finished.
    pub end_position: LogPosition,
    pub truncated_bytes: u64,
    /// Largest transaction id found in the log or the store metadata.
    pub last_tx_id: u64,
}

pub struct RecoveryController {
    wal: Arc<WalManager>,
    applier: Arc<StoreApplier>,
    store_dir: PathBuf,
    meta: StoreMeta,
    read_only: bool,
    state: RecoveryState,
}

impl RecoveryController {
    pub fn new(
        wal: Arc<WalManager>,
        applier: Arc<StoreApplier>,
        meta: StoreMeta,
        read_only: bool,
    ) -> Self {
        let store_dir = applier.store_dir().to_path_buf();
        Self {
            wal,
            applier,
            store_dir,
            meta,
            read_only,
            state: RecoveryState::Unrecovered,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Brings the store files up to date with the log.
    pub fn recover(&mut self) -> Result<RecoveryStats, RecoveryError> {
        self.transition(RecoveryState::Scanning);
        let scan = self.wal.scan()?;
        let last_valid = scan.last_position();
        let logged_checkpoint = scan
            .last_checkpoint()
            .map(|marker| marker.applied_position)
            .unwrap_or_default();
        let checkpoint = self.meta.checkpoint_position.max(logged_checkpoint);

        let mut stats = RecoveryStats {
            records_scanned: scan.records.len(),
            checkpoint_position: checkpoint,
            last_tx_id: scan.max_tx_id().max(self.meta.last_tx_id),
            ..Default::default()
        };

        if let Some(torn) = &scan.torn_tail {
            if last_valid < self.meta.checkpoint_position {
                return Err(RecoveryError::UnrecoverableLog {
                    checkpoint: self.meta.checkpoint_position,
                    last_valid,
                    reason: format!("{} at offset {}", torn.reason, torn.offset),
                });
            }
            warn!(
                "transaction log {:?} has a torn tail at offset {} ({}); discarding {} bytes",
                self.wal.path(),
                torn.offset,
                torn.reason,
                torn.discarded_bytes
            );
            stats.truncated_bytes = torn.discarded_bytes;
        }

        let pending: Vec<_> = scan
            .records
            .iter()
            .filter(|record| record.position > checkpoint)
            .filter_map(|record| match &record.body {
                RecordBody::Transaction(payload) => Some((record.position, record.tx_id, payload)),
                RecordBody::Checkpoint(_) => None,
            })
            .collect();

        // Compaction or a lost log must not restart positions below the checkpoint.
        let resume_after = last_valid.max(self.meta.checkpoint_position);

        if self.read_only {
            if !pending.is_empty() {
                return Err(RecoveryError::RecoveryRequired {
                    pending: pending.len(),
                });
            }
            stats.end_position = resume_after;
            self.transition(RecoveryState::Clean);
            return Ok(stats);
        }

        self.wal.resume(scan.valid_end, resume_after)?;

        self.transition(RecoveryState::Replaying);
        for (position, tx_id, payload) in &pending {
            let commands = decode_batch(payload)?;
            debug!(
                "replaying Tx{} at {} ({} commands)",
                tx_id,
                position,
                commands.len()
            );
            self.applier.apply(&commands)?;
        }
        stats.transactions_replayed = pending.len();

        if !pending.is_empty() || scan.torn_tail.is_some() {
            write_checkpoint(
                &self.wal,
                self.applier.cache(),
                &self.store_dir,
                resume_after,
                stats.last_tx_id,
            )?;
        }
        stats.end_position = self.wal.last_position();
        self.transition(RecoveryState::Clean);
        info!(
            "recovery replayed {} transactions after {}; log continues after {}",
            stats.transactions_replayed, checkpoint, stats.end_position
        );
        Ok(stats)
    }

    fn transition(&mut self, next: RecoveryState) {
        debug!("recovery {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
