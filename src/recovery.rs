//! Recovery and crash resilience module.
//!
//! This module handles:
//! - replaying committed transactions that never reached the store files
//! - truncating torn log tails left by a crash mid-append
//! - checkpointing and log compaction

pub mod checkpoint;
pub mod controller;

pub use checkpoint::{CheckpointOutcome, Checkpointer};
pub use controller::{RecoveryController, RecoveryError, RecoveryState, RecoveryStats};
