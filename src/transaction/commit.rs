//! Commit processes.
//!
//! A store picks one commit process when it opens and keeps it: the
//! read-write process appends, forces and applies; the read-only process
//! rejects every commit without touching the log.

use std::sync::Arc;

use log::debug;

use super::apply::{AppliedPositions, StoreApplier};
use super::command::encode_batch;
use super::error::{TransactionError, TransactionResult};
use super::health::StoreHealth;
use super::manager::Transaction;
use super::state::TransactionState;
use crate::storage::error::StorageError;
use crate::storage::meta::StoreId;
use crate::storage::wal::{LogPosition, WalManager};

/// Turns an active transaction into a durable, applied one.
///
/// Locks are the caller's business: they must be held before `commit` and
/// released after it returns, whatever the outcome.
pub trait TransactionCommitProcess: Send + Sync {
    /// Commits `tx`, returning the log position of its record.
    fn commit(&self, tx: &mut Transaction) -> TransactionResult<LogPosition>;

    fn is_read_only(&self) -> bool;
}

/// Commit process of a store opened read-only.
#[derive(Debug, Default)]
pub struct ReadOnlyCommitProcess;

impl TransactionCommitProcess for ReadOnlyCommitProcess {
    fn commit(&self, tx: &mut Transaction) -> TransactionResult<LogPosition> {
        if !tx.state().is_active() {
            return Err(tx.invalid_state());
        }
        tx.set_state(TransactionState::RolledBack)?;
        Err(TransactionError::ReadOnlyViolation(tx.id()))
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// Append, force, then apply.
pub struct ReadWriteCommitProcess {
    wal: Arc<WalManager>,
    applier: Arc<StoreApplier>,
    health: Arc<StoreHealth>,
    applied: Arc<AppliedPositions>,
}

impl ReadWriteCommitProcess {
    /// Builds the process over `wal`, which must belong to the store `expected`.
    pub fn new(
        wal: Arc<WalManager>,
        applier: Arc<StoreApplier>,
        health: Arc<StoreHealth>,
        applied: Arc<AppliedPositions>,
        expected: StoreId,
    ) -> TransactionResult<Self> {
        if wal.store_id() != expected {
            return Err(StorageError::StoreIdMismatch {
                expected,
                found: wal.store_id(),
            }
            .into());
        }
        Ok(Self {
            wal,
            applier,
            health,
            applied,
        })
    }
}

impl TransactionCommitProcess for ReadWriteCommitProcess {
    fn commit(&self, tx: &mut Transaction) -> TransactionResult<LogPosition> {
        if !tx.state().is_active() {
            return Err(tx.invalid_state());
        }
        self.health.assert_healthy()?;
        let tx_id = tx.id();

        tx.set_state(TransactionState::Committing)?;
        if tx.is_empty() {
            // Nothing to make durable.
            tx.set_state(TransactionState::Committed)?;
            return Ok(LogPosition::default());
        }

        let payload = match encode_batch(tx.commands()) {
            Ok(payload) => payload,
            Err(e) => {
                tx.set_state(TransactionState::RolledBack)?;
                return Err(e);
            }
        };
        let position = match self.wal.append_transaction(tx_id.value(), payload) {
            Ok(position) => position,
            Err(source) => {
                tx.set_state(TransactionState::RolledBack)?;
                return Err(TransactionError::CommitFailure { tx_id, source });
            }
        };

        // Nothing is applied before the record is durable.
        if let Err(source) = self.wal.force(position) {
            // The record may or may not have reached the disk.
            self.health
                .panic(format!("forcing the log for {} at {} failed: {}", tx_id, position, source));
            return Err(TransactionError::CommitFailure { tx_id, source });
        }

        if let Err(source) = self.applier.apply(tx.commands()) {
            self.health
                .panic(format!("applying {} at {} failed: {}", tx_id, position, source));
            return Err(TransactionError::ApplyFailure {
                tx_id,
                position,
                source,
            });
        }

        self.applied.mark_applied(position);
        tx.set_state(TransactionState::Committed)?;
        debug!("{} committed at {}", tx_id, position);
        Ok(position)
    }

    fn is_read_only(&self) -> bool {
        false
    }
}
