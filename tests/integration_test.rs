use std::fs;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::Result;
use tempfile::tempdir;
use vibegraph::concurrency::lock::{
    DeadlockPolicy, LocalLockManager, LockMode, ResourceId, COMMUNITY_LOCK_MANAGER,
};
use vibegraph::schema::{IndexProvider, SchemaRule};
use vibegraph::storage::disk::SingleFileSwapperFactory;
use vibegraph::storage::meta::StoreMeta;
use vibegraph::storage::wal::{LogPosition, RecordBody, WalConfig, WalManager, LOG_FILE_NAME};
use vibegraph::transaction::{encode_batch, Command, StoreFile, TransactionError, TransactionId};
use vibegraph::{Error, GraphStore, StoreConfig};

const PAGE: usize = 256;

fn config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir)
        .with_page_size(PAGE)
        .with_cache_frames(16)
}

/// Appends and forces a transaction record without applying it, as if the
/// process died right after the durability point.
fn append_unapplied(dir: &Path, commands: &[Command]) -> Result<LogPosition> {
    let meta = StoreMeta::load(dir)?.expect("store exists");
    let wal = WalManager::open(dir, meta.store_id, WalConfig::default())?;
    let scan = wal.scan()?;
    wal.resume(
        scan.valid_end,
        scan.last_position().max(meta.checkpoint_position),
    )?;
    let tx_id = scan.max_tx_id().max(meta.last_tx_id) + 1;
    let position = wal.append_transaction(tx_id, encode_batch(commands)?)?;
    wal.force(position)?;
    Ok(position)
}

fn write(file: &str, offset: u64, bytes: &[u8]) -> Command {
    Command::WriteBytes {
        file: StoreFile::new(file).unwrap(),
        offset,
        bytes: bytes.to_vec(),
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        fs::copy(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

#[test]
fn test_crash_after_append_is_replayed() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = GraphStore::open(config(dir.path()))?;
        let mut tx = store.begin();
        tx.write_bytes("nodes.db", 0, b"before".to_vec())?;
        store.commit(&mut tx)?;
        store.close()?;
    }

    append_unapplied(
        dir.path(),
        &[
            write("nodes.db", 0, b"after!"),
            write("nodes.db", 300, b"second page"),
        ],
    )?;

    let store = GraphStore::open(config(dir.path()))?;
    assert_eq!(store.recovery_stats().transactions_replayed, 1);
    assert_eq!(store.read_bytes("nodes.db", 0, 6)?, b"after!".to_vec());
    assert_eq!(store.read_bytes("nodes.db", 300, 11)?, b"second page".to_vec());
    store.close()?;

    // The replay was checkpointed, so a second open has nothing to do.
    let store = GraphStore::open(config(dir.path()))?;
    assert_eq!(store.recovery_stats().transactions_replayed, 0);
    assert_eq!(store.read_bytes("nodes.db", 0, 6)?, b"after!".to_vec());
    Ok(())
}

#[test]
fn test_corrupt_final_record_is_discarded() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = GraphStore::open(config(dir.path()))?;
        let mut tx = store.begin();
        tx.write_bytes("nodes.db", 0, b"kept".to_vec())?;
        store.commit(&mut tx)?;
        store.close()?;
    }
    append_unapplied(dir.path(), &[write("nodes.db", 0, b"lost")])?;

    let log_path = dir.path().join(LOG_FILE_NAME);
    let mut bytes = fs::read(&log_path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&log_path, &bytes)?;

    let store = GraphStore::open(config(dir.path()))?;
    let stats = store.recovery_stats().clone();
    assert!(stats.truncated_bytes > 0);
    assert_eq!(stats.transactions_replayed, 0);
    assert_eq!(store.read_bytes("nodes.db", 0, 4)?, b"kept".to_vec());

    // New commits continue from the last valid record.
    let mut tx = store.begin();
    tx.write_bytes("nodes.db", 4, b"next".to_vec())?;
    let position = store.commit(&mut tx)?;
    assert_eq!(position, store.last_log_position());
    store.close()?;
    Ok(())
}

#[test]
fn test_replaying_twice_matches_replaying_once() -> Result<()> {
    let crashed = tempdir()?;
    {
        let store = GraphStore::open(config(crashed.path()))?;
        let mut tx = store.begin();
        tx.fill("nodes.db", 0, 600, 0x11)?;
        store.commit(&mut tx)?;
        store.close()?;
    }
    append_unapplied(
        crashed.path(),
        &[
            write("nodes.db", 250, &[0xab; 20]),
            Command::FillBytes {
                file: StoreFile::new("nodes.db")?,
                offset: 500,
                len: 50,
                value: 0,
            },
        ],
    )?;
    append_unapplied(crashed.path(), &[write("rels.db", 10, b"edge")])?;

    let snapshot = tempdir()?;
    copy_dir(crashed.path(), snapshot.path())?;
    let twice = tempdir()?;
    copy_dir(crashed.path(), twice.path())?;

    // Once.
    GraphStore::open(config(crashed.path()))?.close()?;

    // Twice: recover, then put the crash-time log and metadata back and recover again.
    GraphStore::open(config(twice.path()))?.close()?;
    for name in [LOG_FILE_NAME, "store.meta"] {
        fs::copy(snapshot.path().join(name), twice.path().join(name))?;
    }
    let store = GraphStore::open(config(twice.path()))?;
    assert_eq!(store.recovery_stats().transactions_replayed, 2);
    store.close()?;

    for file in ["nodes.db", "rels.db"] {
        assert_eq!(
            fs::read(crashed.path().join(file))?,
            fs::read(twice.path().join(file))?,
            "{} differs",
            file
        );
    }
    Ok(())
}

#[test]
fn test_apply_failure_is_recovered_on_reopen() -> Result<()> {
    let dir = tempdir()?;
    let store = GraphStore::open(config(dir.path()).with_cache_frames(1))?;

    // Hold the only frame so the apply cannot proceed.
    let other = store.cache().map_file(&dir.path().join("pinned.db"), PAGE)?;
    let pinned = store.cache().fetch_page(&other, 0)?;

    let mut tx = store.begin();
    store.lock(&mut tx, ResourceId::node(1), LockMode::Exclusive)?;
    tx.write_bytes("nodes.db", 0, b"durable".to_vec())?;
    assert!(matches!(
        store.commit(&mut tx),
        Err(Error::Transaction(TransactionError::ApplyFailure { .. }))
    ));
    assert!(!store.is_healthy());
    assert!(store.lock_manager().held_locks(tx.id()).is_empty());

    drop(pinned);
    let mut next = store.begin();
    next.write_bytes("nodes.db", 0, b"refused".to_vec())?;
    assert!(matches!(
        store.commit(&mut next),
        Err(Error::Transaction(TransactionError::StoreUnhealthy(_)))
    ));
    store.close()?;

    let store = GraphStore::open(config(dir.path()))?;
    assert!(store.is_healthy());
    assert_eq!(store.recovery_stats().transactions_replayed, 1);
    assert_eq!(store.read_bytes("nodes.db", 0, 7)?, b"durable".to_vec());
    Ok(())
}

#[test]
fn test_transaction_ids_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let last = {
        let store = GraphStore::open(config(dir.path()))?;
        let mut last = TransactionId(0);
        for i in 0..3u8 {
            let mut tx = store.begin();
            tx.write_bytes("nodes.db", i as u64, vec![i])?;
            store.commit(&mut tx)?;
            last = tx.id();
        }
        // Rolled back ids are not reused either.
        let mut rolled_back = store.begin();
        store.rollback(&mut rolled_back)?;
        store.close()?;
        rolled_back.id().max(last)
    };

    let store = GraphStore::open(config(dir.path()).with_compact_log_on_checkpoint(true))?;
    let tx = store.begin();
    assert_eq!(tx.id(), TransactionId(last.value() + 1));
    drop(tx);
    store.checkpoint()?;
    store.close()?;

    let store = GraphStore::open(config(dir.path()))?;
    assert!(store.begin().id().value() > last.value() + 1);
    Ok(())
}

#[test]
fn test_checkpoint_compacts_log() -> Result<()> {
    let dir = tempdir()?;
    let store = GraphStore::open(config(dir.path()).with_compact_log_on_checkpoint(true))?;
    for i in 0..5u64 {
        let mut tx = store.begin();
        tx.write_bytes("nodes.db", i * 8, i.to_le_bytes().to_vec())?;
        store.commit(&mut tx)?;
    }

    let outcome = store.checkpoint()?;
    assert_eq!(outcome.applied_position, LogPosition(5));
    assert!(outcome.compacted_bytes.unwrap_or(0) > 0);

    let meta = StoreMeta::load(dir.path())?.expect("store exists");
    let wal = WalManager::open(
        dir.path(),
        meta.store_id,
        WalConfig {
            read_only: true,
            ..Default::default()
        },
    )?;
    let scan = wal.scan()?;
    assert_eq!(scan.records.len(), 1);
    assert!(matches!(scan.records[0].body, RecordBody::Checkpoint(_)));

    let mut tx = store.begin();
    tx.write_bytes("nodes.db", 40, vec![9])?;
    assert_eq!(store.commit(&mut tx)?, outcome.record_position.next());
    store.close()?;

    let store = GraphStore::open(config(dir.path()))?;
    assert_eq!(store.read_bytes("nodes.db", 32, 8)?, 4u64.to_le_bytes().to_vec());
    assert_eq!(store.read_bytes("nodes.db", 40, 1)?, vec![9]);
    Ok(())
}

#[test]
fn test_exclusive_lock_orders_writers() -> Result<()> {
    let dir = tempdir()?;
    let locks = Arc::new(LocalLockManager::new(
        COMMUNITY_LOCK_MANAGER,
        DeadlockPolicy::Detect,
        None,
    ));
    let store = Arc::new(GraphStore::with_collaborators(
        config(dir.path()),
        Arc::new(SingleFileSwapperFactory::new(false)),
        locks.clone(),
    )?);
    let trace = Arc::new(Mutex::new(Vec::new()));
    let node = ResourceId::node(42);

    let mut t1 = store.begin();
    store.lock(&mut t1, node, LockMode::Exclusive)?;
    trace.lock().unwrap().push("t1 locked");

    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = {
        let store = store.clone();
        let trace = trace.clone();
        thread::spawn(move || -> Result<Vec<u8>> {
            let mut t2 = store.begin();
            ready_tx.send(())?;
            store.lock(&mut t2, node, LockMode::Exclusive)?;
            trace.lock().unwrap().push("t2 locked");
            let seen = store.read_bytes("nodes.db", 0, 2)?;
            t2.write_bytes("nodes.db", 0, b"t2".to_vec())?;
            store.commit(&mut t2)?;
            Ok(seen)
        })
    };

    ready_rx.recv()?;
    // Wait until t2 is queued behind t1 on the node.
    while locks.waiters(node) == 0 {
        thread::yield_now();
    }
    t1.write_bytes("nodes.db", 0, b"t1".to_vec())?;
    trace.lock().unwrap().push("t1 committing");
    store.commit(&mut t1)?;

    let seen = handle.join().unwrap()?;
    assert_eq!(seen, b"t1".to_vec());
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["t1 locked", "t1 committing", "t2 locked"]
    );
    assert_eq!(store.read_bytes("nodes.db", 0, 2)?, b"t2".to_vec());
    Ok(())
}

#[test]
fn test_concurrent_commits_get_distinct_positions() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(GraphStore::open(config(dir.path()))?);

    let handles: Vec<_> = (0..8u64)
        .map(|worker| {
            let store = store.clone();
            thread::spawn(move || -> Result<Vec<LogPosition>> {
                let mut positions = Vec::new();
                for round in 0..10u64 {
                    let mut tx = store.begin();
                    let slot = worker * 10 + round;
                    store.lock(&mut tx, ResourceId::node(slot), LockMode::Exclusive)?;
                    tx.write_bytes("nodes.db", slot * 8, slot.to_le_bytes().to_vec())?;
                    positions.push(store.commit(&mut tx)?);
                }
                Ok(positions)
            })
        })
        .collect();

    let mut positions = Vec::new();
    for handle in handles {
        positions.extend(handle.join().unwrap()?);
    }
    positions.sort();
    let expected: Vec<LogPosition> = (1..=80).map(LogPosition).collect();
    assert_eq!(positions, expected);

    let store = Arc::try_unwrap(store).map_err(|_| anyhow::anyhow!("store still shared"))?;
    store.close()?;

    let store = GraphStore::open(config(dir.path()))?;
    for slot in 0..80u64 {
        assert_eq!(store.read_bytes("nodes.db", slot * 8, 8)?, slot.to_le_bytes().to_vec());
    }
    Ok(())
}

#[test]
fn test_schema_rules_survive_restart() -> Result<()> {
    let dir = tempdir()?;
    let index = SchemaRule::ConstraintIndex {
        id: 0,
        label: 2,
        property_key: 5,
        provider: IndexProvider::new("native-btree", "1.0"),
        owning_constraint: None,
    };
    let constraint = SchemaRule::UniquenessConstraint {
        id: 1,
        label: 2,
        property_key: 5,
        owned_index: 0,
    };
    {
        let store = GraphStore::open(config(dir.path()))?;
        let mut tx = store.begin();
        store.lock(&mut tx, ResourceId::schema(0), LockMode::Exclusive)?;
        tx.create_schema_rule(index.clone())?;
        tx.create_schema_rule(constraint.clone())?;
        store.commit(&mut tx)?;

        // Link the index to its constraint in a second transaction.
        let mut tx = store.begin();
        tx.create_schema_rule(index.with_owning_constraint(1))?;
        store.commit(&mut tx)?;
        store.close()?;
    }

    let store = GraphStore::open(config(dir.path()))?;
    assert_eq!(
        store.schema_rules()?,
        vec![index.with_owning_constraint(1), constraint]
    );

    let mut tx = store.begin();
    tx.drop_schema_rule(1)?;
    store.commit(&mut tx)?;
    assert_eq!(store.schema_rules()?.len(), 1);
    Ok(())
}

#[test]
fn test_rejected_transactions_leave_the_log_clean() -> Result<()> {
    let dir = tempdir()?;
    {
        let store = GraphStore::open(config(dir.path()))?;

        let mut tx = store.begin();
        assert!(matches!(
            tx.fill("nodes.db", u64::MAX - 1, 4, 1),
            Err(TransactionError::OutOfRange { .. })
        ));
        tx.write_bytes("nodes.db", 0, b"kept".to_vec())?;
        store.commit(&mut tx)?;

        // Too large for one log record: refused before anything is written.
        let chunk = 40 * 1024 * 1024;
        let mut big = store.begin();
        big.write_bytes("nodes.db", 0, vec![7; chunk])?;
        big.write_bytes("nodes.db", chunk as u64, vec![8; chunk])?;
        assert!(matches!(
            store.commit(&mut big),
            Err(Error::Transaction(TransactionError::CommitFailure { .. }))
        ));
        assert!(store.is_healthy());
        assert!(store.active_transactions().is_empty());
        assert_eq!(store.last_log_position(), LogPosition(1));
        // Dropped without a checkpoint, like a crash.
    }

    let meta = StoreMeta::load(dir.path())?.expect("store exists");
    let wal = WalManager::open(dir.path(), meta.store_id, WalConfig { read_only: true })?;
    let scan = wal.scan()?;
    assert_eq!(scan.records.len(), 1);
    assert!(scan.torn_tail.is_none());
    assert_eq!(scan.valid_end, scan.file_len);
    drop(wal);

    let store = GraphStore::open(config(dir.path()))?;
    assert_eq!(store.recovery_stats().transactions_replayed, 1);
    assert_eq!(store.read_bytes("nodes.db", 0, 4)?, b"kept".to_vec());
    store.close()?;
    Ok(())
}
