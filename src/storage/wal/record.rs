//! Log record types and their on-disk framing.
//!
//! Every record is framed as
//!
//! ```text
//! [length u32][kind u8][position u64][transaction id u64][payload ...][crc32 u32]
//! ```
//!
//! `length` counts the bytes after the length field itself, checksum included.
//! The CRC covers `kind` through the end of the payload. All integers are
//! little-endian.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Bytes between the length prefix and the payload.
pub const RECORD_HEADER_LEN: usize = 1 + 8 + 8;
pub const CHECKSUM_LEN: usize = 4;
/// Upper bound on a single record; longer length prefixes are treated as garbage.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

const CHECKPOINT_PAYLOAD_LEN: usize = 16;

/// Position of a record in the log.
///
/// Positions are strictly increasing and gap-free across all records of a log.
/// Position 0 never names a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub fn next(&self) -> Self {
        LogPosition(self.0 + 1)
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogPosition({})", self.0)
    }
}

/// Record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Transaction = 1,
    Checkpoint = 2,
}

impl RecordKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::Transaction),
            2 => Some(RecordKind::Checkpoint),
            _ => None,
        }
    }
}

/// The last fully applied position, as recorded by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMarker {
    pub applied_position: LogPosition,
    pub last_tx_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    /// Serialized command batch of one transaction.
    Transaction(Vec<u8>),
    Checkpoint(CheckpointMarker),
}

/// A single log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub position: LogPosition,
    /// Owning transaction; 0 for checkpoint records.
    pub tx_id: u64,
    pub body: RecordBody,
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes remain than the frame needs.
    Truncated,
    ChecksumMismatch,
    Invalid(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "truncated record"),
            FrameError::ChecksumMismatch => write!(f, "checksum mismatch"),
            FrameError::Invalid(reason) => write!(f, "invalid record: {}", reason),
        }
    }
}

impl LogRecord {
    pub fn transaction(position: LogPosition, tx_id: u64, payload: Vec<u8>) -> Self {
        LogRecord {
            position,
            tx_id,
            body: RecordBody::Transaction(payload),
        }
    }

    pub fn checkpoint(position: LogPosition, marker: CheckpointMarker) -> Self {
        LogRecord {
            position,
            tx_id: 0,
            body: RecordBody::Checkpoint(marker),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self.body {
            RecordBody::Transaction(_) => RecordKind::Transaction,
            RecordBody::Checkpoint(_) => RecordKind::Checkpoint,
        }
    }

    /// Length of the encoded frame, length prefix included.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_LEN + RECORD_HEADER_LEN + self.payload_len() + CHECKSUM_LEN
    }

    fn payload_len(&self) -> usize {
        match &self.body {
            RecordBody::Transaction(payload) => payload.len(),
            RecordBody::Checkpoint(_) => CHECKPOINT_PAYLOAD_LEN,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let body_len = RECORD_HEADER_LEN + self.payload_len() + CHECKSUM_LEN;
        buf.put_u32_le(body_len as u32);
        buf.put_u8(self.kind() as u8);
        buf.put_u64_le(self.position.0);
        buf.put_u64_le(self.tx_id);
        match &self.body {
            RecordBody::Transaction(payload) => buf.put_slice(payload),
            RecordBody::Checkpoint(marker) => {
                buf.put_u64_le(marker.applied_position.0);
                buf.put_u64_le(marker.last_tx_id);
            }
        }
        let crc = crc32fast::hash(&buf[LENGTH_PREFIX_LEN..]);
        buf.put_u32_le(crc);
        buf.freeze()
    }

    /// Decodes one frame from the front of `src`, returning the record and the
    /// number of bytes it occupied.
    pub fn decode(src: &[u8]) -> Result<(LogRecord, usize), FrameError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Err(FrameError::Truncated);
        }
        let body_len = LittleEndian::read_u32(&src[..LENGTH_PREFIX_LEN]) as usize;
        if body_len < RECORD_HEADER_LEN + CHECKSUM_LEN || body_len > MAX_RECORD_LEN {
            return Err(FrameError::Invalid(format!("length {}", body_len)));
        }
        let total = LENGTH_PREFIX_LEN + body_len;
        if src.len() < total {
            return Err(FrameError::Truncated);
        }

        let body = &src[LENGTH_PREFIX_LEN..total];
        let (covered, crc_bytes) = body.split_at(body_len - CHECKSUM_LEN);
        if crc32fast::hash(covered) != LittleEndian::read_u32(crc_bytes) {
            return Err(FrameError::ChecksumMismatch);
        }

        let kind = RecordKind::from_u8(covered[0])
            .ok_or_else(|| FrameError::Invalid(format!("kind {}", covered[0])))?;
        let position = LogPosition(LittleEndian::read_u64(&covered[1..9]));
        let tx_id = LittleEndian::read_u64(&covered[9..17]);
        let payload = &covered[RECORD_HEADER_LEN..];

        let record = match kind {
            RecordKind::Transaction => LogRecord::transaction(position, tx_id, payload.to_vec()),
            RecordKind::Checkpoint => {
                if payload.len() != CHECKPOINT_PAYLOAD_LEN {
                    return Err(FrameError::Invalid(format!(
                        "checkpoint payload of {} bytes",
                        payload.len()
                    )));
                }
                LogRecord::checkpoint(
                    position,
                    CheckpointMarker {
                        applied_position: LogPosition(LittleEndian::read_u64(&payload[0..8])),
                        last_tx_id: LittleEndian::read_u64(&payload[8..16]),
                    },
                )
            }
        };
        if record.position.is_none() {
            return Err(FrameError::Invalid("position 0".into()));
        }

        Ok((record, total))
    }
}
