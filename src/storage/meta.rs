//! Store identity and the persisted checkpoint marker.
//!
//! `store.meta` is a small fixed-size file:
//!
//! ```text
//! magic "VGMT" | format u16 | reserved u16 | creation_time u64 | random_id u64
//! | store_version u64 | checkpoint_position u64 | last_tx_id u64 | crc32 u32
//! ```
//!
//! All integers are little-endian; the CRC covers every preceding byte.
//! Updates go through a temporary file and an atomic rename.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::LogPosition;

pub const META_FILE_NAME: &str = "store.meta";

/// Version of the on-disk store format this build reads and writes.
pub const STORE_VERSION: u64 = 1;

const META_MAGIC: [u8; 4] = *b"VGMT";
const META_FORMAT: u16 = 1;
pub(crate) const META_LEN: usize = 52;

/// Immutable identity of a store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    pub creation_time: u64,
    pub random_id: u64,
    pub store_version: u64,
}

impl StoreId {
    /// Creates a fresh identity for a new store.
    pub fn generate() -> Self {
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            creation_time,
            random_id: rand::random(),
            store_version: STORE_VERSION,
        }
    }

    pub(crate) fn encode_into(&self, dst: &mut [u8]) {
        LittleEndian::write_u64(&mut dst[0..8], self.creation_time);
        LittleEndian::write_u64(&mut dst[8..16], self.random_id);
        LittleEndian::write_u64(&mut dst[16..24], self.store_version);
    }

    pub(crate) fn decode_from(src: &[u8]) -> Self {
        Self {
            creation_time: LittleEndian::read_u64(&src[0..8]),
            random_id: LittleEndian::read_u64(&src[8..16]),
            store_version: LittleEndian::read_u64(&src[16..24]),
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreId(created={}, random={:016x}, version={})",
            self.creation_time, self.random_id, self.store_version
        )
    }
}

/// Contents of `store.meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMeta {
    pub store_id: StoreId,
    /// Every log record at or below this position is reflected in the store files.
    pub checkpoint_position: LogPosition,
    /// Largest transaction id known at the last checkpoint.
    pub last_tx_id: u64,
}

impl StoreMeta {
    pub fn new(store_id: StoreId) -> Self {
        Self {
            store_id,
            checkpoint_position: LogPosition::default(),
            last_tx_id: 0,
        }
    }

    /// Loads the metadata file from `dir`, returning `None` when it does not exist.
    pub fn load(dir: &Path) -> StorageResult<Option<Self>> {
        let path = dir.join(META_FILE_NAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io_failure(path, e)),
        };
        Self::decode(&bytes).map(Some)
    }

    /// Atomically replaces the metadata file in `dir`.
    pub fn store(&self, dir: &Path) -> StorageResult<()> {
        let path = dir.join(META_FILE_NAME);
        let tmp = dir.join(format!("{}.tmp", META_FILE_NAME));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| StorageError::io_failure(&tmp, e))?;
            file.write_all(&self.encode())
                .and_then(|_| file.sync_all())
                .map_err(|e| StorageError::io_failure(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| StorageError::io_failure(&path, e))?;
        sync_dir(dir)
    }

    fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        buf[0..4].copy_from_slice(&META_MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], META_FORMAT);
        self.store_id.encode_into(&mut buf[8..32]);
        LittleEndian::write_u64(&mut buf[32..40], self.checkpoint_position.0);
        LittleEndian::write_u64(&mut buf[40..48], self.last_tx_id);
        let crc = crc32fast::hash(&buf[..48]);
        LittleEndian::write_u32(&mut buf[48..52], crc);
        buf
    }

    fn decode(src: &[u8]) -> StorageResult<Self> {
        if src.len() != META_LEN {
            return Err(StorageError::MetaCorruption(format!(
                "expected {} bytes, found {}",
                META_LEN,
                src.len()
            )));
        }
        if src[0..4] != META_MAGIC {
            return Err(StorageError::MetaCorruption("magic mismatch".into()));
        }
        let format = LittleEndian::read_u16(&src[4..6]);
        if format != META_FORMAT {
            return Err(StorageError::MetaCorruption(format!(
                "unsupported format {}",
                format
            )));
        }
        let stored_crc = LittleEndian::read_u32(&src[48..52]);
        if crc32fast::hash(&src[..48]) != stored_crc {
            return Err(StorageError::MetaCorruption("checksum mismatch".into()));
        }
        let store_id = StoreId::decode_from(&src[8..32]);
        if store_id.store_version != STORE_VERSION {
            return Err(StorageError::MetaCorruption(format!(
                "unsupported store version {}",
                store_id.store_version
            )));
        }
        Ok(Self {
            store_id,
            checkpoint_position: LogPosition(LittleEndian::read_u64(&src[32..40])),
            last_tx_id: LittleEndian::read_u64(&src[40..48]),
        })
    }
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> StorageResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::io_failure(dir, e))
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}
