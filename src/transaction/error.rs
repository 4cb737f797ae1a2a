//! Transaction error types.

use thiserror::Error;

use super::id::TransactionId;
use super::state::TransactionState;
use crate::storage::error::StorageError;
use crate::storage::wal::LogPosition;

#[derive(Error, Debug)]
pub enum TransactionError {
    /// The log append failed; the transaction never became durable.
    #[error("{tx_id} failed to commit: {source}")]
    CommitFailure {
        tx_id: TransactionId,
        #[source]
        source: StorageError,
    },

    /// The transaction is durable at `position` but applying it to the store
    /// failed. Recovery replays it on the next open.
    #[error("{tx_id} is durable at {position} but could not be applied: {source}")]
    ApplyFailure {
        tx_id: TransactionId,
        position: LogPosition,
        #[source]
        source: StorageError,
    },

    #[error("{0} rejected: store is read-only")]
    ReadOnlyViolation(TransactionId),

    #[error("store refuses commits until it is reopened: {0}")]
    StoreUnhealthy(String),

    #[error("{tx_id} is {state}")]
    InvalidState {
        tx_id: TransactionId,
        state: TransactionState,
    },

    #[error("invalid store file name {0:?}")]
    InvalidStoreFile(String),

    /// A command reaches past the largest store file offset.
    #[error("{len} bytes at offset {offset} of {file} is out of range")]
    OutOfRange { file: String, offset: u64, len: u64 },

    #[error("schema rule id {0} has no slot")]
    SchemaRuleIdOutOfRange(u64),

    #[error("command serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<bincode::Error> for TransactionError {
    fn from(err: bincode::Error) -> Self {
        TransactionError::Serialization(err.to_string())
    }
}

pub type TransactionResult<T> = Result<T, TransactionError>;
