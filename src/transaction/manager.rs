//! Transaction manager for coordinating transaction lifecycle.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::RwLock;

use super::command::{Command, StoreFile};
use super::error::{TransactionError, TransactionResult};
use super::id::{TransactionId, TransactionIdGenerator};
use super::state::TransactionState;
use crate::schema::SchemaRule;

/// A transaction: an id, its command batch, and its state.
///
/// Commands are only recorded here; nothing touches the store until the
/// transaction is handed to a commit process.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    commands: Vec<Command>,
    start_time: Instant,
}

impl Transaction {
    fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            commands: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// True when the transaction has recorded no commands.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Appends a command to the batch. Commands that could never be applied
    /// are refused here rather than after the log append.
    pub fn add(&mut self, command: Command) -> TransactionResult<()> {
        if !self.state.is_active() {
            return Err(self.invalid_state());
        }
        command.validate()?;
        self.commands.push(command);
        Ok(())
    }

    pub fn write_bytes(
        &mut self,
        file: &str,
        offset: u64,
        bytes: impl Into<Vec<u8>>,
    ) -> TransactionResult<()> {
        let file = StoreFile::new(file)?;
        self.add(Command::WriteBytes {
            file,
            offset,
            bytes: bytes.into(),
        })
    }

    pub fn fill(&mut self, file: &str, offset: u64, len: u64, value: u8) -> TransactionResult<()> {
        let file = StoreFile::new(file)?;
        self.add(Command::FillBytes {
            file,
            offset,
            len,
            value,
        })
    }

    pub fn create_schema_rule(&mut self, rule: SchemaRule) -> TransactionResult<()> {
        self.add(Command::CreateSchemaRule(rule))
    }

    pub fn drop_schema_rule(&mut self, id: u64) -> TransactionResult<()> {
        self.add(Command::DropSchemaRule { id })
    }

    pub(crate) fn set_state(&mut self, next: TransactionState) -> TransactionResult<()> {
        if !self.state.can_become(next) {
            return Err(self.invalid_state());
        }
        debug!("{} {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub(crate) fn invalid_state(&self) -> TransactionError {
        TransactionError::InvalidState {
            tx_id: self.id,
            state: self.state,
        }
    }
}

/// Hands out transactions and tracks the ones still running.
pub struct TransactionManager {
    id_generator: TransactionIdGenerator,
    active: RwLock<HashMap<TransactionId, Instant>>,
}

impl TransactionManager {
    /// Creates a manager whose first transaction id follows `last_tx_id`.
    pub fn new(last_tx_id: u64) -> Self {
        Self {
            id_generator: TransactionIdGenerator::starting_after(last_tx_id),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> Transaction {
        let tx = Transaction::new(self.id_generator.next());
        self.active.write().insert(tx.id, tx.start_time);
        debug!("began {}", tx.id);
        tx
    }

    /// Rolls back an active transaction, discarding its commands.
    pub fn rollback(&self, tx: &mut Transaction) -> TransactionResult<()> {
        tx.set_state(TransactionState::RolledBack)?;
        tx.commands.clear();
        self.finish(tx);
        Ok(())
    }

    /// Stops tracking `tx`.
    pub fn finish(&self, tx: &Transaction) {
        self.active.write().remove(&tx.id);
    }

    pub fn is_active(&self, id: TransactionId) -> bool {
        self.active.read().contains_key(&id)
    }

    /// Ids of running transactions, oldest first.
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self.active.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// The most recently issued id, or 0.
    pub fn last_issued(&self) -> TransactionId {
        self.id_generator.current()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(0)
    }
}
