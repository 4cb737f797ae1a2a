//! Concurrency control module.
//!
//! Lock management over logical graph resources, with deadlock detection
//! (wait-for graph) or avoidance (wait-die) selected once at store open.

pub mod lock;

pub use lock::{
    create_lock_manager, DeadlockPolicy, LocalLockManager, LockError, LockManager, LockMode,
    LockResult, LockToken, ResourceId, ResourceType,
};
