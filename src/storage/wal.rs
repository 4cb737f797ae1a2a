//! Write-ahead transaction log.
//!
//! The log is the durability boundary of the store: a transaction counts as
//! committed once its record, and every record before it, has been forced to
//! stable storage. It provides:
//! - record framing with per-record CRC32 checksums
//! - gap-free, strictly increasing log positions
//! - group-committed forcing
//! - scanning with torn-tail detection for recovery
//! - checkpoint markers and log compaction

pub mod manager;
pub mod record;

pub use manager::{LogScan, TornTail, WalConfig, WalManager, LOG_FILE_NAME, LOG_HEADER_LEN};
pub use record::{CheckpointMarker, LogPosition, LogRecord, RecordBody, RecordKind, MAX_RECORD_LEN};
