//! Log manager implementation.
//!
//! The log manager owns the single `transaction.log` file of a store. It
//! validates the file header, scans records for recovery, appends new records,
//! and forces them to stable storage. Forcing is group-committed: a force that
//! finds its position already covered by a concurrent force returns at once.
//!
//! Appends are refused until [`WalManager::resume`] has positioned the writer
//! after the last valid record, which recovery does once the log tail has been
//! checked.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use parking_lot::Mutex;

use super::record::{
    CheckpointMarker, LogPosition, LogRecord, RecordBody, LENGTH_PREFIX_LEN, MAX_RECORD_LEN,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::meta::{sync_dir, StoreId};

pub const LOG_FILE_NAME: &str = "transaction.log";

const LOG_MAGIC: [u8; 4] = *b"VGLG";
const LOG_FORMAT: u16 = 1;
/// magic | format u16 | reserved u16 | store id (24) | crc32 u32
pub const LOG_HEADER_LEN: u64 = 36;

/// Log manager configuration.
#[derive(Debug, Clone, Default)]
pub struct WalConfig {
    /// Whether appends are refused outright.
    pub read_only: bool,
}

/// Where a scan stopped because a record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TornTail {
    /// Byte offset of the first invalid record.
    pub offset: u64,
    /// Bytes from `offset` to the end of the file.
    pub discarded_bytes: u64,
    pub reason: String,
}

/// Result of reading every valid record of the log.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    pub records: Vec<LogRecord>,
    /// Offset just past the last valid record.
    pub valid_end: u64,
    pub file_len: u64,
    pub torn_tail: Option<TornTail>,
}

impl LogScan {
    pub fn last_position(&self) -> LogPosition {
        self.records
            .last()
            .map(|r| r.position)
            .unwrap_or_default()
    }

    /// The newest checkpoint marker in the log, if any.
    pub fn last_checkpoint(&self) -> Option<CheckpointMarker> {
        self.records.iter().rev().find_map(|r| match r.body {
            RecordBody::Checkpoint(marker) => Some(marker),
            RecordBody::Transaction(_) => None,
        })
    }

    /// Largest transaction id mentioned by any record.
    pub fn max_tx_id(&self) -> u64 {
        self.records
            .iter()
            .map(|r| match r.body {
                RecordBody::Checkpoint(marker) => marker.last_tx_id,
                RecordBody::Transaction(_) => r.tx_id,
            })
            .max()
            .unwrap_or(0)
    }
}

struct LogWriter {
    file: Arc<File>,
    end_offset: u64,
    last_position: LogPosition,
    poisoned: Option<String>,
}

impl LogWriter {
    fn append(&mut self, path: &Path, record: &LogRecord) -> StorageResult<()> {
        if let Some(reason) = &self.poisoned {
            return Err(StorageError::LogUnavailable(reason.clone()));
        }
        // A frame the scanner would reject must never reach the file.
        let frame_len = record.encoded_len() - LENGTH_PREFIX_LEN;
        if frame_len > MAX_RECORD_LEN {
            return Err(StorageError::RecordTooLarge {
                len: frame_len,
                max: MAX_RECORD_LEN,
            });
        }

        let bytes = record.encode();
        let result = (&*self.file)
            .seek(SeekFrom::Start(self.end_offset))
            .and_then(|_| (&*self.file).write_all(&bytes));

        if let Err(e) = result {
            // Cut any partial frame so the next append starts on a record boundary.
            let restored = self.file.set_len(self.end_offset);
            if let Err(restore_err) = restored {
                let reason = format!(
                    "append failed ({}) and truncating back to {} failed ({})",
                    e, self.end_offset, restore_err
                );
                warn!("{}", reason);
                self.poisoned = Some(reason);
            }
            return Err(StorageError::io_failure(path, e));
        }

        self.end_offset += bytes.len() as u64;
        self.last_position = record.position;
        Ok(())
    }
}

/// Manager for the append-only transaction log.
pub struct WalManager {
    path: PathBuf,
    dir: PathBuf,
    store_id: StoreId,
    config: WalConfig,
    writer: Mutex<Option<LogWriter>>,
    force_lock: Mutex<()>,
    durable_position: AtomicU64,
    #[cfg(test)]
    fail_forces: std::sync::atomic::AtomicBool,
}

impl WalManager {
    /// Creates a new, empty log in `dir` for `store_id`, replacing any existing one.
    pub fn create(dir: &Path, store_id: StoreId, config: WalConfig) -> StorageResult<Self> {
        let path = dir.join(LOG_FILE_NAME);
        write_new_log(&path, &store_id, &[])?;
        sync_dir(dir)?;
        info!("created transaction log {:?}", path);
        Ok(Self::new(dir, path, store_id, config))
    }

    /// Opens the log in `dir`, creating it when absent and the manager is writable.
    ///
    /// Fails with [`StorageError::StoreIdMismatch`] when the log belongs to
    /// another store.
    pub fn open(dir: &Path, store_id: StoreId, config: WalConfig) -> StorageResult<Self> {
        let path = dir.join(LOG_FILE_NAME);
        if !path.exists() && !config.read_only {
            return Self::create(dir, store_id, config);
        }

        let mut file = File::open(&path).map_err(|e| StorageError::io_failure(&path, e))?;
        let mut header = [0u8; LOG_HEADER_LEN as usize];
        file.read_exact(&mut header).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                StorageError::LogCorruption {
                    offset: 0,
                    reason: "log header truncated".into(),
                }
            } else {
                StorageError::io_failure(&path, e)
            }
        })?;
        let found = decode_header(&header)?;
        if found != store_id {
            return Err(StorageError::StoreIdMismatch {
                expected: store_id,
                found,
            });
        }

        Ok(Self::new(dir, path, store_id, config))
    }

    fn new(dir: &Path, path: PathBuf, store_id: StoreId, config: WalConfig) -> Self {
        WalManager {
            path,
            dir: dir.to_path_buf(),
            store_id,
            config,
            writer: Mutex::new(None),
            force_lock: Mutex::new(()),
            durable_position: AtomicU64::new(0),
            #[cfg(test)]
            fail_forces: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Reads every valid record after the header.
    ///
    /// Scanning stops at the first frame that is truncated, fails its checksum,
    /// or breaks the gap-free position sequence; that frame and everything after
    /// it is reported as a torn tail rather than an error.
    pub fn scan(&self) -> StorageResult<LogScan> {
        let bytes = fs::read(&self.path).map_err(|e| StorageError::io_failure(&self.path, e))?;
        Ok(scan_bytes(&bytes))
    }

    /// Positions the writer at `valid_end`, discarding anything after it, and
    /// enables appends. `last_position` is the position of the last record kept.
    pub fn resume(&self, valid_end: u64, last_position: LogPosition) -> StorageResult<()> {
        if self.config.read_only {
            return Err(StorageError::LogUnavailable("log opened read-only".into()));
        }
        let valid_end = valid_end.max(LOG_HEADER_LEN);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| StorageError::io_failure(&self.path, e))?;
        let len = file
            .metadata()
            .map_err(|e| StorageError::io_failure(&self.path, e))?
            .len();
        if len > valid_end {
            warn!(
                "truncating transaction log {:?} from {} to {} bytes",
                self.path, len, valid_end
            );
            file.set_len(valid_end)
                .map_err(|e| StorageError::io_failure(&self.path, e))?;
        }
        // Records kept from before a crash count as durable from here on.
        file.sync_all()
            .map_err(|e| StorageError::io_failure(&self.path, e))?;

        *self.writer.lock() = Some(LogWriter {
            file: Arc::new(file),
            end_offset: valid_end,
            last_position,
            poisoned: None,
        });
        self.durable_position
            .store(last_position.0, Ordering::SeqCst);
        debug!("log resumed at offset {} after {}", valid_end, last_position);
        Ok(())
    }

    /// Appends a transaction's serialized command batch. The record is written
    /// but not yet forced; see [`WalManager::force`].
    pub fn append_transaction(&self, tx_id: u64, payload: Vec<u8>) -> StorageResult<LogPosition> {
        self.append_with(|position| LogRecord::transaction(position, tx_id, payload))
    }

    /// Appends a checkpoint marker.
    pub fn append_checkpoint(&self, marker: CheckpointMarker) -> StorageResult<LogPosition> {
        self.append_with(|position| LogRecord::checkpoint(position, marker))
    }

    fn append_with(&self, build: impl FnOnce(LogPosition) -> LogRecord) -> StorageResult<LogPosition> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| self.unavailable())?;
        let record = build(writer.last_position.next());
        writer.append(&self.path, &record)?;
        Ok(record.position)
    }

    /// Forces every record up to and including `position` to stable storage.
    pub fn force(&self, position: LogPosition) -> StorageResult<()> {
        if self.durable_position() >= position {
            return Ok(());
        }
        let _force = self.force_lock.lock();
        if self.durable_position() >= position {
            return Ok(());
        }

        let (file, target) = {
            let guard = self.writer.lock();
            let writer = guard.as_ref().ok_or_else(|| self.unavailable())?;
            (Arc::clone(&writer.file), writer.last_position)
        };
        self.injected_force_failure()?;
        file.sync_data()
            .map_err(|e| StorageError::io_failure(&self.path, e))?;
        self.durable_position.fetch_max(target.0, Ordering::SeqCst);
        Ok(())
    }

    /// Position of the last appended record.
    pub fn last_position(&self) -> LogPosition {
        self.writer
            .lock()
            .as_ref()
            .map(|w| w.last_position)
            .unwrap_or_default()
    }

    /// Highest position known to be on stable storage.
    pub fn durable_position(&self) -> LogPosition {
        LogPosition(self.durable_position.load(Ordering::SeqCst))
    }

    /// Rewrites the log so it starts at the record at `keep_from`, dropping every
    /// earlier record. Records appended concurrently are carried over.
    pub fn compact(&self, keep_from: LogPosition) -> StorageResult<u64> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| self.unavailable())?;

        let bytes = fs::read(&self.path).map_err(|e| StorageError::io_failure(&self.path, e))?;
        let scan = scan_bytes(&bytes);
        let mut cut = scan.valid_end;
        let mut offset = LOG_HEADER_LEN;
        for record in &scan.records {
            if record.position >= keep_from {
                cut = offset;
                break;
            }
            offset += record.encoded_len() as u64;
        }
        let kept = &bytes[cut as usize..scan.valid_end as usize];

        let tmp = self.dir.join(format!("{}.compact", LOG_FILE_NAME));
        write_new_log(&tmp, &self.store_id, kept)?;
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::io_failure(&self.path, e))?;
        sync_dir(&self.dir)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| StorageError::io_failure(&self.path, e))?;
        writer.file = Arc::new(file);
        writer.end_offset = LOG_HEADER_LEN + kept.len() as u64;

        let dropped = cut - LOG_HEADER_LEN;
        info!(
            "compacted transaction log: dropped {} bytes before {}",
            dropped, keep_from
        );
        Ok(dropped)
    }

    #[cfg(test)]
    pub(crate) fn fail_forces_for_test(&self, fail: bool) {
        self.fail_forces.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_force_failure(&self) -> StorageResult<()> {
        if self.fail_forces.load(Ordering::SeqCst) {
            let err = std::io::Error::new(ErrorKind::Other, "injected sync failure");
            return Err(StorageError::io_failure(&self.path, err));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_force_failure(&self) -> StorageResult<()> {
        Ok(())
    }

    fn unavailable(&self) -> StorageError {
        if self.config.read_only {
            StorageError::LogUnavailable("log opened read-only".into())
        } else {
            StorageError::LogUnavailable("log has not been recovered".into())
        }
    }
}

fn encode_header(store_id: &StoreId) -> [u8; LOG_HEADER_LEN as usize] {
    let mut buf = [0u8; LOG_HEADER_LEN as usize];
    buf[0..4].copy_from_slice(&LOG_MAGIC);
    LittleEndian::write_u16(&mut buf[4..6], LOG_FORMAT);
    store_id.encode_into(&mut buf[8..32]);
    let crc = crc32fast::hash(&buf[..32]);
    LittleEndian::write_u32(&mut buf[32..36], crc);
    buf
}

fn decode_header(src: &[u8]) -> StorageResult<StoreId> {
    let corrupt = |reason: &str| StorageError::LogCorruption {
        offset: 0,
        reason: reason.to_string(),
    };
    if src[0..4] != LOG_MAGIC {
        return Err(corrupt("log magic mismatch"));
    }
    if LittleEndian::read_u16(&src[4..6]) != LOG_FORMAT {
        return Err(corrupt("unsupported log format"));
    }
    if crc32fast::hash(&src[..32]) != LittleEndian::read_u32(&src[32..36]) {
        return Err(corrupt("log header checksum mismatch"));
    }
    Ok(StoreId::decode_from(&src[8..32]))
}

fn write_new_log(path: &Path, store_id: &StoreId, records: &[u8]) -> StorageResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| StorageError::io_failure(path, e))?;
    file.write_all(&encode_header(store_id))
        .and_then(|_| file.write_all(records))
        .and_then(|_| file.sync_all())
        .map_err(|e| StorageError::io_failure(path, e))
}

fn scan_bytes(bytes: &[u8]) -> LogScan {
    let file_len = bytes.len() as u64;
    let mut scan = LogScan {
        valid_end: LOG_HEADER_LEN.min(file_len),
        file_len,
        ..Default::default()
    };

    let mut offset = LOG_HEADER_LEN as usize;
    let mut expected: Option<LogPosition> = None;
    while offset < bytes.len() {
        let reason = match LogRecord::decode(&bytes[offset..]) {
            Ok((record, used)) => match expected {
                Some(next) if record.position != next => {
                    format!("position {} where {} was expected", record.position, next)
                }
                _ => {
                    expected = Some(record.position.next());
                    offset += used;
                    scan.valid_end = offset as u64;
                    scan.records.push(record);
                    continue;
                }
            },
            Err(e) => e.to_string(),
        };
        scan.torn_tail = Some(TornTail {
            offset: offset as u64,
            discarded_bytes: file_len - offset as u64,
            reason,
        });
        break;
    }
    scan
}
