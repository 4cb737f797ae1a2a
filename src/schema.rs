//! Schema rules and their on-disk format.
//!
//! Rules live in fixed-size slots of the schema store file; a rule's id is its
//! slot index. Version 1 encodes a rule as
//!
//! ```text
//! [label u32][kind u8] then per kind:
//!   index:             [provider key][provider version][key count u16 = 1][property key u64]
//!   constraint index:  same as index, then [owning constraint i64, -1 if none]
//!   uniqueness:        [key count u16 = 1][property key u64][owned index u64]
//! ```
//!
//! Strings are a u32 byte length followed by UTF-8. Integers are little-endian.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the schema store file inside the store directory.
pub const SCHEMA_STORE_FILE: &str = "schema.db";
/// Size of one rule slot in the schema store.
pub const SCHEMA_SLOT_SIZE: usize = 256;

const SLOT_HEADER_LEN: usize = 1 + 2;
const SLOT_IN_USE: u8 = 1;
const NO_OWNING_CONSTRAINT: i64 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown schema rule kind {0}")]
    UnknownKind(u8),

    #[error("schema rule {id} is truncated")]
    Truncated { id: u64 },

    #[error("schema rule {id} has invalid text")]
    InvalidUtf8 { id: u64 },

    #[error("schema rule {id} encodes to {len} bytes, slots hold {max}")]
    TooLarge { id: u64, len: usize, max: usize },

    #[error("schema rule {id} has {count} property keys, only one is supported")]
    UnsupportedKeyCount { id: u64, count: u16 },
}

pub type SchemaResult<T> = Result<T, SchemaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchemaRuleKind {
    Index = 1,
    ConstraintIndex = 2,
    UniquenessConstraint = 3,
}

impl SchemaRuleKind {
    fn from_u8(value: u8) -> SchemaResult<Self> {
        match value {
            1 => Ok(Self::Index),
            2 => Ok(Self::ConstraintIndex),
            3 => Ok(Self::UniquenessConstraint),
            other => Err(SchemaError::UnknownKind(other)),
        }
    }
}

/// Identifies the index implementation backing an index rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexProvider {
    pub key: String,
    pub version: String,
}

impl IndexProvider {
    pub fn new(key: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaRule {
    Index {
        id: u64,
        label: u32,
        property_key: u64,
        provider: IndexProvider,
    },
    /// Index backing a uniqueness constraint. The owning constraint is unset
    /// while the constraint is being created.
    ConstraintIndex {
        id: u64,
        label: u32,
        property_key: u64,
        provider: IndexProvider,
        owning_constraint: Option<u64>,
    },
    UniquenessConstraint {
        id: u64,
        label: u32,
        property_key: u64,
        owned_index: u64,
    },
}

impl SchemaRule {
    pub fn id(&self) -> u64 {
        match self {
            SchemaRule::Index { id, .. }
            | SchemaRule::ConstraintIndex { id, .. }
            | SchemaRule::UniquenessConstraint { id, .. } => *id,
        }
    }

    pub fn label(&self) -> u32 {
        match self {
            SchemaRule::Index { label, .. }
            | SchemaRule::ConstraintIndex { label, .. }
            | SchemaRule::UniquenessConstraint { label, .. } => *label,
        }
    }

    pub fn property_key(&self) -> u64 {
        match self {
            SchemaRule::Index { property_key, .. }
            | SchemaRule::ConstraintIndex { property_key, .. }
            | SchemaRule::UniquenessConstraint { property_key, .. } => *property_key,
        }
    }

    pub fn kind(&self) -> SchemaRuleKind {
        match self {
            SchemaRule::Index { .. } => SchemaRuleKind::Index,
            SchemaRule::ConstraintIndex { .. } => SchemaRuleKind::ConstraintIndex,
            SchemaRule::UniquenessConstraint { .. } => SchemaRuleKind::UniquenessConstraint,
        }
    }

    /// Returns a copy of a constraint index owned by `constraint`. Other rules
    /// are returned unchanged.
    pub fn with_owning_constraint(&self, constraint: u64) -> SchemaRule {
        match self {
            SchemaRule::ConstraintIndex {
                id,
                label,
                property_key,
                provider,
                ..
            } => SchemaRule::ConstraintIndex {
                id: *id,
                label: *label,
                property_key: *property_key,
                provider: provider.clone(),
                owning_constraint: Some(constraint),
            },
            other => other.clone(),
        }
    }

    pub fn encode_v1(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.label());
        buf.put_u8(self.kind() as u8);
        match self {
            SchemaRule::Index {
                property_key,
                provider,
                ..
            } => {
                put_provider(&mut buf, provider);
                put_property_key(&mut buf, *property_key);
            }
            SchemaRule::ConstraintIndex {
                property_key,
                provider,
                owning_constraint,
                ..
            } => {
                put_provider(&mut buf, provider);
                put_property_key(&mut buf, *property_key);
                buf.put_i64_le(owning_constraint.map_or(NO_OWNING_CONSTRAINT, |c| c as i64));
            }
            SchemaRule::UniquenessConstraint {
                property_key,
                owned_index,
                ..
            } => {
                put_property_key(&mut buf, *property_key);
                buf.put_u64_le(*owned_index);
            }
        }
        buf.to_vec()
    }

    pub fn decode_v1(id: u64, src: &[u8]) -> SchemaResult<SchemaRule> {
        let truncated = |_| SchemaError::Truncated { id };
        let mut cursor = Cursor::new(src);
        let label = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let kind = SchemaRuleKind::from_u8(cursor.read_u8().map_err(truncated)?)?;

        let rule = match kind {
            SchemaRuleKind::Index => {
                let provider = read_provider(id, &mut cursor)?;
                let property_key = read_property_key(id, &mut cursor)?;
                SchemaRule::Index {
                    id,
                    label,
                    property_key,
                    provider,
                }
            }
            SchemaRuleKind::ConstraintIndex => {
                let provider = read_provider(id, &mut cursor)?;
                let property_key = read_property_key(id, &mut cursor)?;
                let owner = cursor.read_i64::<LittleEndian>().map_err(truncated)?;
                SchemaRule::ConstraintIndex {
                    id,
                    label,
                    property_key,
                    provider,
                    owning_constraint: (owner != NO_OWNING_CONSTRAINT).then_some(owner as u64),
                }
            }
            SchemaRuleKind::UniquenessConstraint => {
                let property_key = read_property_key(id, &mut cursor)?;
                let owned_index = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                SchemaRule::UniquenessConstraint {
                    id,
                    label,
                    property_key,
                    owned_index,
                }
            }
        };
        Ok(rule)
    }

    /// Encodes the rule into a full schema store slot.
    pub fn encode_slot(&self) -> SchemaResult<Vec<u8>> {
        let payload = self.encode_v1();
        let max = SCHEMA_SLOT_SIZE - SLOT_HEADER_LEN;
        if payload.len() > max {
            return Err(SchemaError::TooLarge {
                id: self.id(),
                len: payload.len(),
                max,
            });
        }
        let mut slot = BytesMut::with_capacity(SCHEMA_SLOT_SIZE);
        slot.put_u8(SLOT_IN_USE);
        slot.put_u16_le(payload.len() as u16);
        slot.put_slice(&payload);
        slot.resize(SCHEMA_SLOT_SIZE, 0);
        Ok(slot.to_vec())
    }

    /// Decodes a schema store slot; an unused slot yields `None`.
    pub fn decode_slot(id: u64, slot: &[u8]) -> SchemaResult<Option<SchemaRule>> {
        if slot.len() < SLOT_HEADER_LEN || slot[0] != SLOT_IN_USE {
            return Ok(None);
        }
        let len = u16::from_le_bytes([slot[1], slot[2]]) as usize;
        let payload = slot
            .get(SLOT_HEADER_LEN..SLOT_HEADER_LEN + len)
            .ok_or(SchemaError::Truncated { id })?;
        Self::decode_v1(id, payload).map(Some)
    }

    /// Byte offset of a rule's slot in the schema store; `None` when the id
    /// is too large to have one.
    pub fn slot_offset(id: u64) -> Option<u64> {
        id.checked_mul(SCHEMA_SLOT_SIZE as u64)
    }
}

fn put_provider(buf: &mut BytesMut, provider: &IndexProvider) {
    for text in [&provider.key, &provider.version] {
        buf.put_u32_le(text.len() as u32);
        buf.put_slice(text.as_bytes());
    }
}

fn put_property_key(buf: &mut BytesMut, property_key: u64) {
    buf.put_u16_le(1);
    buf.put_u64_le(property_key);
}

fn read_string(id: u64, cursor: &mut Cursor<&[u8]>) -> SchemaResult<String> {
    let len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| SchemaError::Truncated { id })? as usize;
    if len > SCHEMA_SLOT_SIZE {
        return Err(SchemaError::Truncated { id });
    }
    let mut bytes = vec![0u8; len];
    cursor
        .read_exact(&mut bytes)
        .map_err(|_| SchemaError::Truncated { id })?;
    String::from_utf8(bytes).map_err(|_| SchemaError::InvalidUtf8 { id })
}

fn read_provider(id: u64, cursor: &mut Cursor<&[u8]>) -> SchemaResult<IndexProvider> {
    let key = read_string(id, cursor)?;
    let version = read_string(id, cursor)?;
    Ok(IndexProvider { key, version })
}

fn read_property_key(id: u64, cursor: &mut Cursor<&[u8]>) -> SchemaResult<u64> {
    let truncated = |_| SchemaError::Truncated { id };
    let count = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    if count != 1 {
        return Err(SchemaError::UnsupportedKeyCount { id, count });
    }
    cursor.read_u64::<LittleEndian>().map_err(truncated)
}
