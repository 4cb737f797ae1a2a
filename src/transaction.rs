//! Transactions and the commit pipeline.
//!
//! This module provides:
//! - transaction ids, states and lifecycle management
//! - command batches and their log encoding
//! - the read-write and read-only commit processes
//! - the store applier shared by commit and recovery
//! - store health, which stops commits after a failed apply

pub mod apply;
pub mod command;
pub mod commit;
pub mod error;
pub mod health;
pub mod id;
pub mod manager;
pub mod state;

pub use apply::{AppliedPositions, StoreApplier};
pub use command::{decode_batch, encode_batch, Command, StoreFile};
pub use commit::{ReadOnlyCommitProcess, ReadWriteCommitProcess, TransactionCommitProcess};
pub use error::{TransactionError, TransactionResult};
pub use health::StoreHealth;
pub use id::{TransactionId, TransactionIdGenerator};
pub use manager::{Transaction, TransactionManager};
pub use state::TransactionState;
