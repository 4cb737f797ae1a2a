//! Crate-level error type.

use thiserror::Error;

use crate::concurrency::lock::LockError;
use crate::recovery::RecoveryError;
use crate::schema::SchemaError;
use crate::storage::error::StorageError;
use crate::transaction::error::TransactionError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type Result<T> = std::result::Result<T, Error>;
