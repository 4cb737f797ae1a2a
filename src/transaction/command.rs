//! Store mutations carried by a transaction.
//!
//! Every command is absolute: applying it twice leaves the store in the same
//! state as applying it once, which is what lets recovery replay a log tail
//! without knowing how much of it already reached the store files.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{TransactionError, TransactionResult};
use crate::schema::{SchemaRule, SCHEMA_SLOT_SIZE, SCHEMA_STORE_FILE};
use crate::storage::meta::META_FILE_NAME;
use crate::storage::wal::{LOG_FILE_NAME, MAX_RECORD_LEN};

/// Largest offset any store file may grow to.
pub const MAX_STORE_FILE_LEN: u64 = 1 << 48;
/// Most bytes a single command may touch.
pub const MAX_COMMAND_LEN: u64 = MAX_RECORD_LEN as u64;

/// Name of a store file, relative to the store directory.
///
/// Only plain file names are accepted; the log and metadata files are
/// reserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreFile(String);

impl StoreFile {
    pub fn new(name: impl Into<String>) -> TransactionResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 128
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && name != LOG_FILE_NAME
            && name != META_FILE_NAME
            && !name.starts_with(LOG_FILE_NAME)
            && !name.starts_with(META_FILE_NAME);
        if valid {
            Ok(StoreFile(name))
        } else {
            Err(TransactionError::InvalidStoreFile(name))
        }
    }

    /// The schema store.
    pub fn schema() -> Self {
        StoreFile(SCHEMA_STORE_FILE.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StoreFile {
    type Error = TransactionError;

    fn try_from(name: String) -> TransactionResult<Self> {
        StoreFile::new(name)
    }
}

impl From<StoreFile> for String {
    fn from(file: StoreFile) -> Self {
        file.0
    }
}

impl fmt::Display for StoreFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Overwrite bytes at an absolute offset; may span pages.
    WriteBytes {
        file: StoreFile,
        offset: u64,
        bytes: Vec<u8>,
    },
    /// Set `len` bytes starting at `offset` to `value`.
    FillBytes {
        file: StoreFile,
        offset: u64,
        len: u64,
        value: u8,
    },
    /// Write a rule into its slot of the schema store.
    CreateSchemaRule(SchemaRule),
    /// Clear the slot of rule `id`.
    DropSchemaRule { id: u64 },
}

fn check_range(file: &StoreFile, offset: u64, len: u64) -> TransactionResult<()> {
    match offset.checked_add(len) {
        Some(end) if len <= MAX_COMMAND_LEN && end <= MAX_STORE_FILE_LEN => Ok(()),
        _ => Err(TransactionError::OutOfRange {
            file: file.to_string(),
            offset,
            len,
        }),
    }
}

fn schema_slot_offset(id: u64) -> TransactionResult<u64> {
    let offset =
        SchemaRule::slot_offset(id).ok_or(TransactionError::SchemaRuleIdOutOfRange(id))?;
    check_range(&StoreFile::schema(), offset, SCHEMA_SLOT_SIZE as u64)
        .map_err(|_| TransactionError::SchemaRuleIdOutOfRange(id))?;
    Ok(offset)
}

impl Command {
    /// Checks that the command can be applied: its byte range fits a store
    /// file and a schema rule fits its slot.
    pub fn validate(&self) -> TransactionResult<()> {
        match self {
            Command::WriteBytes {
                file,
                offset,
                bytes,
            } => check_range(file, *offset, bytes.len() as u64),
            Command::FillBytes {
                file, offset, len, ..
            } => check_range(file, *offset, *len),
            Command::CreateSchemaRule(rule) => {
                schema_slot_offset(rule.id())?;
                rule.encode_slot()
                    .map_err(|e| TransactionError::Serialization(e.to_string()))?;
                Ok(())
            }
            Command::DropSchemaRule { id } => schema_slot_offset(*id).map(|_| ()),
        }
    }

    /// Reduces the command to the byte-level mutation that applies it.
    pub fn to_mutation(&self) -> TransactionResult<Mutation> {
        self.validate()?;
        let mutation = match self {
            Command::WriteBytes {
                file,
                offset,
                bytes,
            } => Mutation::Write {
                file: file.clone(),
                offset: *offset,
                bytes: bytes.clone(),
            },
            Command::FillBytes {
                file,
                offset,
                len,
                value,
            } => Mutation::Fill {
                file: file.clone(),
                offset: *offset,
                len: *len,
                value: *value,
            },
            Command::CreateSchemaRule(rule) => Mutation::Write {
                file: StoreFile::schema(),
                offset: schema_slot_offset(rule.id())?,
                bytes: rule
                    .encode_slot()
                    .map_err(|e| TransactionError::Serialization(e.to_string()))?,
            },
            Command::DropSchemaRule { id } => Mutation::Fill {
                file: StoreFile::schema(),
                offset: schema_slot_offset(*id)?,
                len: SCHEMA_SLOT_SIZE as u64,
                value: 0,
            },
        };
        Ok(mutation)
    }
}

/// Byte-level form of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Write {
        file: StoreFile,
        offset: u64,
        bytes: Vec<u8>,
    },
    Fill {
        file: StoreFile,
        offset: u64,
        len: u64,
        value: u8,
    },
}

/// Serializes a command batch for a log record. A command that could not be
/// applied is refused here so it never reaches the log.
pub fn encode_batch(commands: &[Command]) -> TransactionResult<Vec<u8>> {
    for command in commands {
        command.validate()?;
    }
    Ok(bincode::serialize(commands)?)
}

pub fn decode_batch(payload: &[u8]) -> TransactionResult<Vec<Command>> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IndexProvider;

    #[test]
    fn test_store_file_validation() {
        assert!(StoreFile::new("nodes.db").is_ok());
        assert!(StoreFile::new("rel_groups-2.db").is_ok());

        for bad in [
            "",
            "../nodes.db",
            "a/b",
            ".hidden",
            LOG_FILE_NAME,
            META_FILE_NAME,
            "store.meta.tmp",
            "transaction.log.compact",
        ] {
            assert!(
                matches!(StoreFile::new(bad), Err(TransactionError::InvalidStoreFile(_))),
                "{:?} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_batch_preserves_order() -> TransactionResult<()> {
        let file = StoreFile::new("nodes.db")?;
        let commands = vec![
            Command::FillBytes {
                file: file.clone(),
                offset: 0,
                len: 16,
                value: 0xff,
            },
            Command::WriteBytes {
                file,
                offset: 4,
                bytes: vec![1, 2, 3],
            },
            Command::CreateSchemaRule(SchemaRule::Index {
                id: 0,
                label: 1,
                property_key: 2,
                provider: IndexProvider::new("native", "1.0"),
            }),
            Command::DropSchemaRule { id: 4 },
        ];
        assert_eq!(decode_batch(&encode_batch(&commands)?)?, commands);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_reserved_file_name() -> TransactionResult<()> {
        // Encode a batch naming the log file by bypassing validation.
        let forged = vec![Command::WriteBytes {
            file: StoreFile(LOG_FILE_NAME.to_string()),
            offset: 0,
            bytes: vec![0],
        }];
        let payload = encode_batch(&forged)?;
        assert!(decode_batch(&payload).is_err());
        Ok(())
    }

    #[test]
    fn test_schema_commands_target_slots() -> TransactionResult<()> {
        let rule = SchemaRule::UniquenessConstraint {
            id: 3,
            label: 1,
            property_key: 2,
            owned_index: 0,
        };
        match Command::CreateSchemaRule(rule).to_mutation()? {
            Mutation::Write {
                file,
                offset,
                bytes,
            } => {
                assert_eq!(file, StoreFile::schema());
                assert_eq!(offset, 3 * SCHEMA_SLOT_SIZE as u64);
                assert_eq!(bytes.len(), SCHEMA_SLOT_SIZE);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            Command::DropSchemaRule { id: 3 }.to_mutation()?,
            Mutation::Fill {
                file: StoreFile::schema(),
                offset: 3 * SCHEMA_SLOT_SIZE as u64,
                len: SCHEMA_SLOT_SIZE as u64,
                value: 0,
            }
        );
        Ok(())
    }

    #[test]
    fn test_out_of_range_commands_rejected() -> TransactionResult<()> {
        let file = StoreFile::new("nodes.db")?;
        let bad = [
            Command::FillBytes {
                file: file.clone(),
                offset: u64::MAX - 1,
                len: 4,
                value: 1,
            },
            Command::FillBytes {
                file: file.clone(),
                offset: MAX_STORE_FILE_LEN,
                len: 1,
                value: 1,
            },
            Command::FillBytes {
                file: file.clone(),
                offset: 0,
                len: MAX_COMMAND_LEN + 1,
                value: 1,
            },
            Command::WriteBytes {
                file: file.clone(),
                offset: MAX_STORE_FILE_LEN - 1,
                bytes: vec![1, 2],
            },
        ];
        for command in bad {
            assert!(
                matches!(command.to_mutation(), Err(TransactionError::OutOfRange { .. })),
                "{:?} accepted",
                command
            );
            assert!(encode_batch(&[command]).is_err());
        }

        for id in [u64::MAX, u64::MAX / SCHEMA_SLOT_SIZE as u64] {
            let command = Command::DropSchemaRule { id };
            assert!(matches!(
                command.validate(),
                Err(TransactionError::SchemaRuleIdOutOfRange(bad)) if bad == id
            ));
        }

        let edge = Command::FillBytes {
            file,
            offset: MAX_STORE_FILE_LEN - 8,
            len: 8,
            value: 1,
        };
        assert!(edge.validate().is_ok());
        Ok(())
    }
}
