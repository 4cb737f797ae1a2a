//! The graph store: every storage collaborator, wired by explicit construction.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::concurrency::lock::{create_lock_manager, LockManager, LockMode, ResourceId};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::recovery::{CheckpointOutcome, Checkpointer, RecoveryController, RecoveryStats};
use crate::schema::SchemaRule;
use crate::storage::buffer::PageCache;
use crate::storage::disk::{SingleFileSwapperFactory, SwapperFactory};
use crate::storage::error::StorageError;
use crate::storage::meta::{StoreId, StoreMeta, META_FILE_NAME};
use crate::storage::wal::{LogPosition, WalConfig, WalManager};
use crate::transaction::{
    AppliedPositions, ReadOnlyCommitProcess, ReadWriteCommitProcess, StoreApplier, StoreFile,
    StoreHealth, Transaction, TransactionCommitProcess, TransactionId, TransactionManager,
};

/// An open store.
///
/// Opening runs recovery to completion before the store accepts any commit.
pub struct GraphStore {
    config: StoreConfig,
    store_id: StoreId,
    cache: PageCache,
    wal: Arc<WalManager>,
    applier: Arc<StoreApplier>,
    lock_manager: Arc<dyn LockManager>,
    commit_process: Box<dyn TransactionCommitProcess>,
    transactions: TransactionManager,
    health: Arc<StoreHealth>,
    checkpointer: Option<Checkpointer>,
    recovery: RecoveryStats,
}

impl GraphStore {
    /// Opens (or creates) the store described by `config`, using file-backed
    /// swappers and the configured lock manager.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let factory = Arc::new(SingleFileSwapperFactory::new(config.read_only));
        let lock_manager = create_lock_manager(&config.lock_manager, config.lock_timeout)?;
        Self::with_collaborators(config, factory, lock_manager)
    }

    /// Opens the store over already-built collaborators.
    pub fn with_collaborators(
        config: StoreConfig,
        factory: Arc<dyn SwapperFactory>,
        lock_manager: Arc<dyn LockManager>,
    ) -> Result<Self> {
        let dir = config.store_dir.clone();
        let meta = load_or_create_meta(&dir, config.read_only)?;

        let wal = Arc::new(WalManager::open(
            &dir,
            meta.store_id,
            WalConfig {
                read_only: config.read_only,
            },
        )?);
        let cache = PageCache::new(factory, config.cache_frames, config.page_size);
        let applier = Arc::new(StoreApplier::new(cache.clone(), &dir, config.page_size));

        let recovery =
            RecoveryController::new(wal.clone(), applier.clone(), meta, config.read_only)
                .recover()?;

        let health = Arc::new(StoreHealth::new());
        let applied = Arc::new(AppliedPositions::starting_at(recovery.end_position));
        let mut checkpointer = None;
        let commit_process: Box<dyn TransactionCommitProcess> = if config.read_only {
            Box::new(ReadOnlyCommitProcess)
        } else {
            let process = ReadWriteCommitProcess::new(
                wal.clone(),
                applier.clone(),
                health.clone(),
                applied.clone(),
                meta.store_id,
            )?;
            checkpointer = Some(Checkpointer::new(
                wal.clone(),
                cache.clone(),
                applied,
                &dir,
                config.compact_log_on_checkpoint,
            ));
            Box::new(process)
        };

        info!(
            "opened store {:?} ({}, lock manager {}, {} frames of {} bytes)",
            dir,
            if config.read_only { "read-only" } else { "read-write" },
            lock_manager.name(),
            config.cache_frames,
            config.page_size
        );
        Ok(Self {
            store_id: meta.store_id,
            transactions: TransactionManager::new(recovery.last_tx_id),
            config,
            cache,
            wal,
            applier,
            lock_manager,
            commit_process,
            health,
            checkpointer,
            recovery,
        })
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.commit_process.is_read_only()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// What recovery did when the store was opened.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.lock_manager
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Position of the newest log record.
    pub fn last_log_position(&self) -> LogPosition {
        self.wal.last_position()
    }

    pub fn begin(&self) -> Transaction {
        self.transactions.begin()
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.transactions.active_transactions()
    }

    /// Locks `resource` for `tx`. A deadlock or timeout aborts the
    /// transaction; its locks are already released when this returns.
    pub fn lock(&self, tx: &mut Transaction, resource: ResourceId, mode: LockMode) -> Result<()> {
        if !tx.state().is_active() {
            return Err(tx.invalid_state().into());
        }
        if let Err(e) = self.lock_manager.acquire(tx.id(), resource, mode) {
            if e.is_abort() {
                self.transactions.rollback(tx)?;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Commits `tx` and releases its locks, whatever the outcome.
    pub fn commit(&self, tx: &mut Transaction) -> Result<LogPosition> {
        let result = self.commit_process.commit(tx);
        self.lock_manager.release_all(tx.id());
        if tx.state().is_active() {
            // Refused before the pipeline took the transaction over.
            self.transactions.rollback(tx)?;
        } else {
            self.transactions.finish(tx);
        }
        Ok(result?)
    }

    /// Rolls back `tx` and releases its locks.
    pub fn rollback(&self, tx: &mut Transaction) -> Result<()> {
        self.lock_manager.release_all(tx.id());
        self.transactions.rollback(tx)?;
        Ok(())
    }

    /// Flushes the store and writes a checkpoint.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        let checkpointer = self.checkpointer.as_ref().ok_or_else(|| {
            StorageError::LogUnavailable("store is read-only".to_string())
        })?;
        Ok(checkpointer.checkpoint(self.transactions.last_issued().value())?)
    }

    /// Reads bytes of a store file as seen by committed transactions.
    pub fn read_bytes(&self, file: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = StoreFile::new(file)?;
        Ok(self.applier.read_bytes(&file, offset, len)?)
    }

    pub fn file_len(&self, file: &str) -> Result<u64> {
        let file = StoreFile::new(file)?;
        Ok(self.applier.file_len(&file)?)
    }

    pub fn schema_rules(&self) -> Result<Vec<SchemaRule>> {
        Ok(self.applier.schema_rules()?)
    }

    /// Checkpoints a healthy writable store, then flushes and unmaps every file.
    pub fn close(self) -> Result<()> {
        if self.checkpointer.is_some() && self.health.is_healthy() {
            self.checkpoint()?;
        }
        self.applier.close()?;
        self.cache.close()?;
        info!("closed store {:?}", self.config.store_dir);
        Ok(())
    }
}

fn load_or_create_meta(dir: &Path, read_only: bool) -> Result<StoreMeta> {
    if !read_only {
        fs::create_dir_all(dir).map_err(|e| StorageError::io_failure(dir, e))?;
    }
    if let Some(meta) = StoreMeta::load(dir)? {
        return Ok(meta);
    }
    if read_only {
        let path = dir.join(META_FILE_NAME);
        let missing = io::Error::new(io::ErrorKind::NotFound, "store does not exist");
        return Err(StorageError::io_failure(path, missing).into());
    }
    let meta = StoreMeta::new(StoreId::generate());
    meta.store(dir)?;
    info!("created store {:?}", dir);
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::lock::LockError;
    use crate::error::Error;
    use crate::transaction::TransactionError;
    use anyhow::Result;
    use tempfile::tempdir;

    fn config(dir: &Path) -> StoreConfig {
        StoreConfig::new(dir).with_page_size(512).with_cache_frames(8)
    }

    #[test]
    fn test_create_and_reopen() -> Result<()> {
        let dir = tempdir()?;
        let store = GraphStore::open(config(dir.path()))?;
        let store_id = store.store_id();
        assert!(dir.path().join(META_FILE_NAME).exists());

        let mut tx = store.begin();
        tx.write_bytes("nodes.db", 0, b"node-0".to_vec())?;
        store.commit(&mut tx)?;
        store.close()?;

        let store = GraphStore::open(config(dir.path()))?;
        assert_eq!(store.store_id(), store_id);
        assert_eq!(store.recovery_stats().transactions_replayed, 0);
        assert_eq!(store.read_bytes("nodes.db", 0, 6)?, b"node-0".to_vec());
        Ok(())
    }

    #[test]
    fn test_commit_releases_locks() -> Result<()> {
        let dir = tempdir()?;
        let store = GraphStore::open(config(dir.path()))?;

        let mut tx = store.begin();
        store.lock(&mut tx, ResourceId::node(7), LockMode::Exclusive)?;
        tx.fill("nodes.db", 0, 16, 0xee)?;
        assert_eq!(store.lock_manager().held_locks(tx.id()).len(), 1);

        store.commit(&mut tx)?;
        assert!(store.lock_manager().held_locks(tx.id()).is_empty());
        assert!(store.active_transactions().is_empty());

        let mut other = store.begin();
        assert!(store
            .lock_manager()
            .try_acquire(other.id(), ResourceId::node(7), LockMode::Exclusive)?);
        store.rollback(&mut other)?;
        assert!(store.lock_manager().held_locks(other.id()).is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_lock_manager() -> Result<()> {
        let dir = tempdir()?;
        let result = GraphStore::open(config(dir.path()).with_lock_manager("enterprise"));
        assert!(matches!(
            result,
            Err(Error::Lock(LockError::UnknownLockManager(name))) if name == "enterprise"
        ));
        Ok(())
    }

    #[test]
    fn test_read_only_store() -> Result<()> {
        let dir = tempdir()?;
        assert!(GraphStore::open(config(dir.path()).with_read_only(true)).is_err());

        let store = GraphStore::open(config(dir.path()))?;
        let mut tx = store.begin();
        tx.write_bytes("nodes.db", 8, vec![5, 6])?;
        store.commit(&mut tx)?;
        store.close()?;

        let store = GraphStore::open(config(dir.path()).with_read_only(true))?;
        assert!(store.is_read_only());
        assert_eq!(store.read_bytes("nodes.db", 8, 2)?, vec![5, 6]);

        let mut tx = store.begin();
        store.lock(&mut tx, ResourceId::node(1), LockMode::Exclusive)?;
        tx.write_bytes("nodes.db", 8, vec![0])?;
        assert!(matches!(
            store.commit(&mut tx),
            Err(Error::Transaction(TransactionError::ReadOnlyViolation(_)))
        ));
        assert!(store.lock_manager().held_locks(tx.id()).is_empty());
        assert!(store.checkpoint().is_err());
        store.close()?;
        Ok(())
    }
}
