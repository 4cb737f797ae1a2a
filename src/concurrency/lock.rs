//! Lock management for graph store transactions.
//!
//! Transactions take shared or exclusive locks on logical resources (nodes,
//! relationships, schema, ...) before touching the pages that back them.
//! Requests are queued per resource and granted in arrival order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::transaction::TransactionId;

/// Lock modes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock for readers.
    Shared,
    /// Exclusive lock for writers.
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// True if holding `self` already grants `other`.
    pub fn covers(&self, other: &LockMode) -> bool {
        *self == LockMode::Exclusive || *other == LockMode::Shared
    }
}

/// Kind of a lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Node,
    Relationship,
    Schema,
    Label,
    RelationshipType,
    PropertyKey,
}

/// Identifier for a lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub resource_type: ResourceType,
    pub id: u64,
}

impl ResourceId {
    pub fn new(resource_type: ResourceType, id: u64) -> Self {
        Self { resource_type, id }
    }

    pub fn node(id: u64) -> Self {
        Self::new(ResourceType::Node, id)
    }

    pub fn relationship(id: u64) -> Self {
        Self::new(ResourceType::Relationship, id)
    }

    pub fn schema(id: u64) -> Self {
        Self::new(ResourceType::Schema, id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.resource_type, self.id)
    }
}

/// A lock held by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken {
    pub tx_id: TransactionId,
    pub resource: ResourceId,
    pub mode: LockMode,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("{tx_id} aborted: deadlock while waiting for {resource}")]
    DeadlockDetected {
        tx_id: TransactionId,
        resource: ResourceId,
    },

    #[error("{tx_id} aborted: waited {waited:?} for {resource}")]
    LockTimeout {
        tx_id: TransactionId,
        resource: ResourceId,
        waited: Duration,
    },

    #[error("{tx_id} holds no lock on {resource}")]
    NotHeld {
        tx_id: TransactionId,
        resource: ResourceId,
    },

    #[error("unknown lock manager implementation: {0:?}")]
    UnknownLockManager(String),
}

impl LockError {
    /// True when the requesting transaction was aborted and lost all its locks.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            LockError::DeadlockDetected { .. } | LockError::LockTimeout { .. }
        )
    }
}

pub type LockResult<T> = Result<T, LockError>;

/// Lock manager capability shared by every implementation.
///
/// A transaction that gets `DeadlockDetected` or `LockTimeout` back has
/// already had every lock it held released.
pub trait LockManager: Send + Sync {
    /// Implementation name, as used for selection.
    fn name(&self) -> &str;

    /// Blocks until `mode` is granted on `resource`. Requesting a mode the
    /// transaction already holds (or a weaker one) is a no-op; requesting
    /// exclusive while holding shared is an upgrade.
    fn acquire(&self, tx_id: TransactionId, resource: ResourceId, mode: LockMode) -> LockResult<()>;

    /// Grants the lock only if that is possible without waiting.
    fn try_acquire(
        &self,
        tx_id: TransactionId,
        resource: ResourceId,
        mode: LockMode,
    ) -> LockResult<bool>;

    fn release(&self, tx_id: TransactionId, resource: ResourceId) -> LockResult<()>;

    /// Releases every lock held by the transaction. Safe to call more than once.
    fn release_all(&self, tx_id: TransactionId);

    fn held_locks(&self, tx_id: TransactionId) -> Vec<LockToken>;
}

/// How waiting transactions are kept out of deadlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockPolicy {
    /// Maintain a wait-for graph and abort the requester that closes a cycle.
    Detect,
    /// A requester younger than a transaction it would wait on is aborted;
    /// older requesters wait.
    WaitDie,
}

pub const COMMUNITY_LOCK_MANAGER: &str = "community";
pub const WAIT_DIE_LOCK_MANAGER: &str = "wait-die";

/// Builds the lock manager registered under `name`. An empty name selects
/// the community implementation.
pub fn create_lock_manager(
    name: &str,
    timeout: Option<Duration>,
) -> LockResult<Arc<dyn LockManager>> {
    let name = if name.is_empty() {
        info!(
            "No lock manager configured, using {:?}",
            COMMUNITY_LOCK_MANAGER
        );
        COMMUNITY_LOCK_MANAGER
    } else {
        name
    };
    match name {
        COMMUNITY_LOCK_MANAGER => Ok(Arc::new(LocalLockManager::new(
            COMMUNITY_LOCK_MANAGER,
            DeadlockPolicy::Detect,
            timeout,
        ))),
        WAIT_DIE_LOCK_MANAGER => Ok(Arc::new(LocalLockManager::new(
            WAIT_DIE_LOCK_MANAGER,
            DeadlockPolicy::WaitDie,
            timeout,
        ))),
        other => Err(LockError::UnknownLockManager(other.to_string())),
    }
}

/// Request for a lock from a transaction.
#[derive(Debug, Clone)]
struct LockRequest {
    tx_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

/// Queue of lock requests on one resource (granted ones first).
#[derive(Debug)]
struct ResourceQueue {
    requests: VecDeque<LockRequest>,
    cv: Arc<Condvar>,
}

impl ResourceQueue {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            cv: Arc::new(Condvar::new()),
        }
    }

    fn granted_mode(&self, tx_id: TransactionId) -> Option<LockMode> {
        self.requests
            .iter()
            .filter(|r| r.granted && r.tx_id == tx_id)
            .map(|r| r.mode)
            .max_by_key(|mode| *mode == LockMode::Exclusive)
    }

    fn is_granted(&self, tx_id: TransactionId, mode: LockMode) -> bool {
        self.granted_mode(tx_id)
            .map_or(false, |held| held.covers(&mode))
    }

    fn has_waiter(&self, tx_id: TransactionId) -> bool {
        self.requests.iter().any(|r| !r.granted && r.tx_id == tx_id)
    }

    /// Queues a request. Upgrades go ahead of every other waiter so that a
    /// shared holder is not stuck behind writers waiting on itself.
    fn enqueue(&mut self, tx_id: TransactionId, mode: LockMode, upgrade: bool) {
        let request = LockRequest {
            tx_id,
            mode,
            granted: false,
        };
        if upgrade {
            let first_waiting = self
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(self.requests.len());
            self.requests.insert(first_waiting, request);
        } else {
            self.requests.push_back(request);
        }
    }

    /// Transactions the waiting request of `tx_id` is blocked behind.
    fn blockers(&self, tx_id: TransactionId) -> Vec<TransactionId> {
        let Some(pos) = self.requests.iter().position(|r| !r.granted && r.tx_id == tx_id) else {
            return Vec::new();
        };
        let mode = self.requests[pos].mode;
        let mut blockers: Vec<TransactionId> = self
            .requests
            .iter()
            .enumerate()
            .filter(|(i, r)| r.tx_id != tx_id && (r.granted || *i < pos))
            .filter(|(_, r)| !r.mode.is_compatible_with(&mode))
            .map(|(_, r)| r.tx_id)
            .collect();
        blockers.sort();
        blockers.dedup();
        blockers
    }

    /// Grants waiting requests in arrival order, stopping at the first one
    /// that conflicts with a granted lock.
    fn grant_waiting(&mut self) {
        let mut granted_any = false;
        let mut i = 0;
        while i < self.requests.len() {
            if self.requests[i].granted {
                i += 1;
                continue;
            }
            let LockRequest { tx_id, mode, .. } = self.requests[i];
            let compatible = self
                .requests
                .iter()
                .filter(|r| r.granted && r.tx_id != tx_id)
                .all(|r| r.mode.is_compatible_with(&mode));
            if !compatible {
                break;
            }
            self.requests[i].granted = true;
            granted_any = true;
            // An upgrade replaces the weaker grant.
            let before = self.requests.len();
            self.requests
                .retain(|r| !(r.tx_id == tx_id && r.granted && r.mode != mode));
            if self.requests.len() < before {
                i = 0;
            } else {
                i += 1;
            }
        }

        if granted_any {
            self.cv.notify_all();
        }
    }

    fn remove_waiter(&mut self, tx_id: TransactionId) {
        self.requests.retain(|r| r.granted || r.tx_id != tx_id);
    }

    /// Removes every request of `tx_id`; returns whether any was granted.
    fn remove_all(&mut self, tx_id: TransactionId) -> bool {
        let held = self.requests.iter().any(|r| r.granted && r.tx_id == tx_id);
        self.requests.retain(|r| r.tx_id != tx_id);
        held
    }
}

/// Deadlock detection information.
#[derive(Debug, Default)]
struct DeadlockDetector {
    /// Wait-for graph: tx -> transactions it waits on.
    wait_for: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl DeadlockDetector {
    fn set_edges(&mut self, waiter: TransactionId, holders: &[TransactionId]) {
        if holders.is_empty() {
            self.wait_for.remove(&waiter);
        } else {
            self.wait_for
                .insert(waiter, holders.iter().copied().collect());
        }
    }

    fn clear_edges(&mut self, waiter: TransactionId) {
        self.wait_for.remove(&waiter);
    }

    /// Removes all edges from and to a transaction.
    fn remove_transaction(&mut self, tx_id: TransactionId) {
        self.wait_for.remove(&tx_id);
        for wait_set in self.wait_for.values_mut() {
            wait_set.remove(&tx_id);
        }
    }

    /// True if `waiter` is reachable from any of its holders.
    fn has_cycle(&self, waiter: TransactionId) -> bool {
        let Some(holders) = self.wait_for.get(&waiter) else {
            return false;
        };
        let mut visited = HashSet::new();
        let mut queue: VecDeque<TransactionId> = holders.iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if current == waiter {
                return true;
            }
            if visited.insert(current) {
                if let Some(waiting_for) = self.wait_for.get(&current) {
                    queue.extend(waiting_for.iter().copied());
                }
            }
        }
        false
    }
}

#[derive(Debug, Default)]
struct LockTable {
    resources: HashMap<ResourceId, ResourceQueue>,
    held: HashMap<TransactionId, HashSet<ResourceId>>,
    detector: DeadlockDetector,
}

impl LockTable {
    fn record_grant(&mut self, tx_id: TransactionId, resource: ResourceId) {
        self.held.entry(tx_id).or_default().insert(resource);
    }

    fn drop_if_idle(&mut self, resource: &ResourceId) {
        if self
            .resources
            .get(resource)
            .map_or(false, |queue| queue.requests.is_empty())
        {
            self.resources.remove(resource);
        }
    }

    /// Grants what the queue on `resource` now allows and brings the
    /// wait-for edges of its waiters up to date. A waiter granted here stops
    /// waiting at once, even before its thread wakes up.
    fn regrant(&mut self, resource: ResourceId) {
        let Some(queue) = self.resources.get_mut(&resource) else {
            return;
        };
        let waiting: HashSet<TransactionId> = queue
            .requests
            .iter()
            .filter(|r| !r.granted)
            .map(|r| r.tx_id)
            .collect();
        queue.grant_waiting();
        let updates: Vec<(TransactionId, Option<Vec<TransactionId>>)> = waiting
            .into_iter()
            .map(|tx_id| {
                let blockers = queue.has_waiter(tx_id).then(|| queue.blockers(tx_id));
                (tx_id, blockers)
            })
            .collect();
        for (tx_id, blockers) in updates {
            match blockers {
                Some(blockers) => self.detector.set_edges(tx_id, &blockers),
                None => {
                    self.detector.clear_edges(tx_id);
                    self.record_grant(tx_id, resource);
                }
            }
        }
    }

    fn release_all(&mut self, tx_id: TransactionId) -> usize {
        let resources = self.held.remove(&tx_id).unwrap_or_default();
        let count = resources.len();
        for resource in resources {
            if let Some(queue) = self.resources.get_mut(&resource) {
                queue.remove_all(tx_id);
            }
            self.regrant(resource);
            self.drop_if_idle(&resource);
        }
        self.detector.remove_transaction(tx_id);
        count
    }

    /// Withdraws a waiting request and releases everything `tx_id` holds.
    fn abort(&mut self, tx_id: TransactionId, resource: ResourceId) {
        if let Some(queue) = self.resources.get_mut(&resource) {
            queue.remove_waiter(tx_id);
        }
        self.regrant(resource);
        self.drop_if_idle(&resource);
        let released = self.release_all(tx_id);
        debug!(
            "{} aborted while waiting for {}, released {} locks",
            tx_id, resource, released
        );
    }
}

/// In-process lock manager over per-resource FIFO queues.
pub struct LocalLockManager {
    name: &'static str,
    policy: DeadlockPolicy,
    timeout: Option<Duration>,
    table: Mutex<LockTable>,
}

impl LocalLockManager {
    pub fn new(name: &'static str, policy: DeadlockPolicy, timeout: Option<Duration>) -> Self {
        Self {
            name,
            policy,
            timeout,
            table: Mutex::new(LockTable::default()),
        }
    }

    pub fn policy(&self) -> DeadlockPolicy {
        self.policy
    }

    /// Number of requests waiting on `resource`.
    pub fn waiters(&self, resource: ResourceId) -> usize {
        let table = self.table.lock();
        table
            .resources
            .get(&resource)
            .map_or(0, |queue| queue.requests.iter().filter(|r| !r.granted).count())
    }

    /// Current holders of `resource`.
    pub fn holders(&self, resource: ResourceId) -> Vec<LockToken> {
        let table = self.table.lock();
        table
            .resources
            .get(&resource)
            .map(|queue| {
                queue
                    .requests
                    .iter()
                    .filter(|r| r.granted)
                    .map(|r| LockToken {
                        tx_id: r.tx_id,
                        resource,
                        mode: r.mode,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Queues the request; returns true if it was granted right away.
    fn request(&self, table: &mut LockTable, tx_id: TransactionId, resource: ResourceId, mode: LockMode) -> bool {
        let queue = table
            .resources
            .entry(resource)
            .or_insert_with(ResourceQueue::new);
        if queue.is_granted(tx_id, mode) {
            return true;
        }
        let upgrade = queue.granted_mode(tx_id).is_some();
        queue.enqueue(tx_id, mode, upgrade);
        table.regrant(resource);
        table
            .resources
            .get(&resource)
            .map_or(false, |queue| queue.is_granted(tx_id, mode) && !queue.has_waiter(tx_id))
    }

    /// Checks the deadlock policy for a waiting request.
    fn must_abort(&self, table: &mut LockTable, tx_id: TransactionId, resource: ResourceId) -> bool {
        let blockers = table
            .resources
            .get(&resource)
            .map(|queue| queue.blockers(tx_id))
            .unwrap_or_default();
        match self.policy {
            DeadlockPolicy::Detect => {
                table.detector.set_edges(tx_id, &blockers);
                table.detector.has_cycle(tx_id)
            }
            DeadlockPolicy::WaitDie => blockers.iter().any(|holder| *holder < tx_id),
        }
    }
}

impl LockManager for LocalLockManager {
    fn name(&self) -> &str {
        self.name
    }

    fn acquire(&self, tx_id: TransactionId, resource: ResourceId, mode: LockMode) -> LockResult<()> {
        let start = Instant::now();
        let mut table = self.table.lock();
        if self.request(&mut table, tx_id, resource, mode) {
            return Ok(());
        }
        debug!("{} waits for {:?} on {}", tx_id, mode, resource);

        loop {
            let Some(queue) = table.resources.get(&resource) else {
                break;
            };
            if queue.is_granted(tx_id, mode) && !queue.has_waiter(tx_id) {
                table.detector.clear_edges(tx_id);
                table.record_grant(tx_id, resource);
                return Ok(());
            }
            let cv = Arc::clone(&queue.cv);

            if self.must_abort(&mut table, tx_id, resource) {
                table.abort(tx_id, resource);
                return Err(LockError::DeadlockDetected { tx_id, resource });
            }

            match self.timeout {
                Some(timeout) => {
                    let waited = start.elapsed();
                    if waited >= timeout {
                        table.abort(tx_id, resource);
                        return Err(LockError::LockTimeout {
                            tx_id,
                            resource,
                            waited,
                        });
                    }
                    cv.wait_for(&mut table, timeout - waited);
                }
                None => cv.wait(&mut table),
            }
        }

        // The queue vanished underneath a waiter: nothing can grant it now.
        table.abort(tx_id, resource);
        Err(LockError::DeadlockDetected { tx_id, resource })
    }

    fn try_acquire(
        &self,
        tx_id: TransactionId,
        resource: ResourceId,
        mode: LockMode,
    ) -> LockResult<bool> {
        let mut table = self.table.lock();
        if self.request(&mut table, tx_id, resource, mode) {
            return Ok(true);
        }
        if let Some(queue) = table.resources.get_mut(&resource) {
            queue.remove_waiter(tx_id);
        }
        table.regrant(resource);
        table.drop_if_idle(&resource);
        Ok(false)
    }

    fn release(&self, tx_id: TransactionId, resource: ResourceId) -> LockResult<()> {
        let mut table = self.table.lock();
        let held = table
            .resources
            .get_mut(&resource)
            .map_or(false, |queue| queue.remove_all(tx_id));
        table.regrant(resource);
        table.drop_if_idle(&resource);
        if let Some(set) = table.held.get_mut(&tx_id) {
            set.remove(&resource);
            if set.is_empty() {
                table.held.remove(&tx_id);
            }
        }
        if held {
            Ok(())
        } else {
            Err(LockError::NotHeld { tx_id, resource })
        }
    }

    fn release_all(&self, tx_id: TransactionId) {
        let released = self.table.lock().release_all(tx_id);
        if released > 0 {
            debug!("{} released {} locks", tx_id, released);
        }
    }

    fn held_locks(&self, tx_id: TransactionId) -> Vec<LockToken> {
        let table = self.table.lock();
        let Some(resources) = table.held.get(&tx_id) else {
            return Vec::new();
        };
        let mut tokens: Vec<LockToken> = resources
            .iter()
            .filter_map(|resource| {
                let mode = table.resources.get(resource)?.granted_mode(tx_id)?;
                Some(LockToken {
                    tx_id,
                    resource: *resource,
                    mode,
                })
            })
            .collect();
        tokens.sort_by_key(|token| token.resource);
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn tx(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn community() -> Arc<LocalLockManager> {
        Arc::new(LocalLockManager::new(
            COMMUNITY_LOCK_MANAGER,
            DeadlockPolicy::Detect,
            Some(Duration::from_secs(10)),
        ))
    }

    fn wait_for_waiters(manager: &LocalLockManager, resource: ResourceId, n: usize) {
        while manager.waiters(resource) < n {
            thread::yield_now();
        }
    }

    #[test]
    fn test_lock_compatibility() {
        assert!(LockMode::Shared.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Shared.is_compatible_with(&LockMode::Exclusive));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Shared));
        assert!(!LockMode::Exclusive.is_compatible_with(&LockMode::Exclusive));

        assert!(LockMode::Exclusive.covers(&LockMode::Shared));
        assert!(!LockMode::Shared.covers(&LockMode::Exclusive));
    }

    #[test]
    fn test_basic_lock_acquire_release() -> LockResult<()> {
        let manager = community();
        let node = ResourceId::node(100);

        manager.acquire(tx(1), node, LockMode::Shared)?;
        assert_eq!(
            manager.held_locks(tx(1)),
            vec![LockToken {
                tx_id: tx(1),
                resource: node,
                mode: LockMode::Shared
            }]
        );

        manager.release(tx(1), node)?;
        assert!(manager.held_locks(tx(1)).is_empty());
        assert_eq!(
            manager.release(tx(1), node),
            Err(LockError::NotHeld {
                tx_id: tx(1),
                resource: node
            })
        );
        Ok(())
    }

    #[test]
    fn test_multiple_shared_locks() -> LockResult<()> {
        let manager = community();
        let node = ResourceId::node(100);

        manager.acquire(tx(1), node, LockMode::Shared)?;
        manager.acquire(tx(2), node, LockMode::Shared)?;
        manager.acquire(tx(3), node, LockMode::Shared)?;
        assert_eq!(manager.holders(node).len(), 3);

        assert!(!manager.try_acquire(tx(4), node, LockMode::Exclusive)?);
        assert_eq!(manager.waiters(node), 0);
        Ok(())
    }

    #[test]
    fn test_reacquire_is_noop() -> LockResult<()> {
        let manager = community();
        let rel = ResourceId::relationship(7);

        manager.acquire(tx(1), rel, LockMode::Exclusive)?;
        manager.acquire(tx(1), rel, LockMode::Exclusive)?;
        manager.acquire(tx(1), rel, LockMode::Shared)?;
        assert_eq!(manager.holders(rel).len(), 1);

        manager.release(tx(1), rel)?;
        assert!(manager.holders(rel).is_empty());
        Ok(())
    }

    #[test]
    fn test_exclusive_waits_for_release_all() {
        let manager = community();
        let resource = ResourceId::node(1);
        let trace = Arc::new(Mutex::new(Vec::new()));

        manager
            .acquire(tx(1), resource, LockMode::Exclusive)
            .expect("T1 lock");

        let handle = {
            let manager = manager.clone();
            let trace = trace.clone();
            thread::spawn(move || {
                trace.lock().push("T2 requests");
                let result = manager.acquire(tx(2), resource, LockMode::Exclusive);
                trace.lock().push("T2 granted");
                result
            })
        };

        wait_for_waiters(&manager, resource, 1);
        assert_eq!(manager.holders(resource)[0].tx_id, tx(1));
        trace.lock().push("T1 releases");
        manager.release_all(tx(1));

        handle.join().expect("T2 panicked").expect("T2 lock");
        assert_eq!(
            *trace.lock(),
            vec!["T2 requests", "T1 releases", "T2 granted"]
        );
        assert_eq!(manager.holders(resource)[0].tx_id, tx(2));
    }

    #[test]
    fn test_fifo_grant_order() {
        let manager = community();
        let resource = ResourceId::node(5);
        let order = Arc::new(Mutex::new(Vec::new()));

        manager
            .acquire(tx(1), resource, LockMode::Exclusive)
            .expect("T1 lock");

        let mut handles = Vec::new();
        for (i, id) in [2u64, 3, 4].into_iter().enumerate() {
            let manager_clone = manager.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                manager_clone
                    .acquire(tx(id), resource, LockMode::Exclusive)
                    .expect("queued lock");
                order.lock().push(id);
                manager_clone.release_all(tx(id));
            }));
            wait_for_waiters(&manager, resource, i + 1);
        }

        manager.release_all(tx(1));
        for handle in handles {
            handle.join().expect("waiter panicked");
        }
        assert_eq!(*order.lock(), vec![2, 3, 4]);
    }

    #[test]
    fn test_shared_waits_behind_queued_exclusive() {
        let manager = community();
        let resource = ResourceId::node(9);

        manager
            .acquire(tx(1), resource, LockMode::Shared)
            .expect("T1 lock");
        let writer = {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire(tx(2), resource, LockMode::Exclusive))
        };
        wait_for_waiters(&manager, resource, 1);

        // A new reader must not jump ahead of the waiting writer.
        assert!(!manager
            .try_acquire(tx(3), resource, LockMode::Shared)
            .expect("try lock"));

        manager.release_all(tx(1));
        writer.join().expect("writer panicked").expect("writer lock");
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let manager = community();
        let resource = ResourceId::node(42);
        let inside = Arc::new(AtomicUsize::new(0));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads as u64)
            .map(|i| {
                let manager = manager.clone();
                let inside = inside.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for round in 0..20u64 {
                        let id = tx(1 + i * 100 + round);
                        manager
                            .acquire(id, resource, LockMode::Exclusive)
                            .expect("lock");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        manager.release_all(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert!(manager.holders(resource).is_empty());
    }

    #[test]
    fn test_release_all_locks() -> LockResult<()> {
        let manager = community();
        let lock1 = ResourceId::node(100);
        let lock2 = ResourceId::relationship(200);
        let lock3 = ResourceId::schema(3);

        manager.acquire(tx(1), lock1, LockMode::Shared)?;
        manager.acquire(tx(1), lock2, LockMode::Exclusive)?;
        manager.acquire(tx(1), lock3, LockMode::Shared)?;
        assert_eq!(manager.held_locks(tx(1)).len(), 3);

        manager.release_all(tx(1));
        assert!(manager.held_locks(tx(1)).is_empty());
        assert!(manager.holders(lock2).is_empty());

        // Idempotent.
        manager.release_all(tx(1));
        Ok(())
    }

    #[test]
    fn test_deadlock_detected_and_victim_released() {
        let manager = community();
        let a = ResourceId::node(1);
        let b = ResourceId::node(2);

        manager.acquire(tx(1), a, LockMode::Exclusive).expect("T1 a");
        manager.acquire(tx(2), b, LockMode::Exclusive).expect("T2 b");

        let t1 = {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire(tx(1), b, LockMode::Exclusive))
        };
        wait_for_waiters(&manager, b, 1);

        let err = manager
            .acquire(tx(2), a, LockMode::Exclusive)
            .expect_err("cycle must be detected");
        assert_eq!(
            err,
            LockError::DeadlockDetected {
                tx_id: tx(2),
                resource: a
            }
        );
        assert!(err.is_abort());
        assert!(manager.held_locks(tx(2)).is_empty());

        t1.join().expect("T1 panicked").expect("T1 gets b");
        assert_eq!(manager.held_locks(tx(1)).len(), 2);
    }

    #[test]
    fn test_granted_waiter_no_longer_blocks_others() {
        let manager = community();
        let first = ResourceId::node(1);
        let second = ResourceId::node(2);

        for round in 0..50u64 {
            let (t1, t2) = (tx(round * 2 + 1), tx(round * 2 + 2));
            manager
                .acquire(t1, first, LockMode::Exclusive)
                .expect("T1 lock");
            manager
                .acquire(t2, second, LockMode::Exclusive)
                .expect("T2 lock");

            let waiter = {
                let manager = manager.clone();
                thread::spawn(move || {
                    let result = manager.acquire(t2, first, LockMode::Exclusive);
                    manager.release_all(t2);
                    result
                })
            };
            wait_for_waiters(&manager, first, 1);

            // T2 holds `first` from here on, whether or not its thread ran yet.
            manager.release(t1, first).expect("T1 release");
            assert!(!manager.table.lock().detector.wait_for.contains_key(&t2));

            manager
                .acquire(t1, second, LockMode::Exclusive)
                .expect("T1 waits for T2 without a cycle");
            waiter.join().expect("T2 panicked").expect("T2 lock");
            manager.release_all(t1);
        }
        assert!(manager.table.lock().detector.wait_for.is_empty());
    }

    #[test]
    fn test_upgrade_waits_for_other_readers() {
        let manager = community();
        let resource = ResourceId::node(3);

        manager.acquire(tx(1), resource, LockMode::Shared).expect("T1");
        manager.acquire(tx(2), resource, LockMode::Shared).expect("T2");

        let upgrader = {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire(tx(1), resource, LockMode::Exclusive))
        };
        wait_for_waiters(&manager, resource, 1);
        manager.release(tx(2), resource).expect("T2 release");

        upgrader.join().expect("upgrader panicked").expect("upgrade");
        assert_eq!(
            manager.holders(resource),
            vec![LockToken {
                tx_id: tx(1),
                resource,
                mode: LockMode::Exclusive
            }]
        );
    }

    #[test]
    fn test_concurrent_upgrades_deadlock() {
        let manager = community();
        let resource = ResourceId::schema(0);

        manager.acquire(tx(1), resource, LockMode::Shared).expect("T1");
        manager.acquire(tx(2), resource, LockMode::Shared).expect("T2");

        let first = {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire(tx(1), resource, LockMode::Exclusive))
        };
        wait_for_waiters(&manager, resource, 1);

        assert!(matches!(
            manager.acquire(tx(2), resource, LockMode::Exclusive),
            Err(LockError::DeadlockDetected { .. })
        ));
        first.join().expect("T1 panicked").expect("T1 upgrade");
    }

    #[test]
    fn test_lock_timeout_releases_everything() {
        let manager = Arc::new(LocalLockManager::new(
            COMMUNITY_LOCK_MANAGER,
            DeadlockPolicy::Detect,
            Some(Duration::from_millis(50)),
        ));
        let contended = ResourceId::node(1);
        let other = ResourceId::node(2);

        manager
            .acquire(tx(1), contended, LockMode::Exclusive)
            .expect("T1");
        manager.acquire(tx(2), other, LockMode::Shared).expect("T2");

        let err = manager
            .acquire(tx(2), contended, LockMode::Shared)
            .expect_err("must time out");
        assert!(matches!(err, LockError::LockTimeout { .. }));
        assert!(manager.held_locks(tx(2)).is_empty());
        assert_eq!(manager.waiters(contended), 0);
    }

    #[test]
    fn test_wait_die_younger_dies() {
        let manager = Arc::new(LocalLockManager::new(
            WAIT_DIE_LOCK_MANAGER,
            DeadlockPolicy::WaitDie,
            Some(Duration::from_secs(10)),
        ));
        let a = ResourceId::node(1);
        let b = ResourceId::node(2);

        manager.acquire(tx(1), a, LockMode::Exclusive).expect("T1 a");
        manager.acquire(tx(2), b, LockMode::Exclusive).expect("T2 b");

        // Younger T2 would wait on older T1: it dies and loses b.
        assert!(matches!(
            manager.acquire(tx(2), a, LockMode::Exclusive),
            Err(LockError::DeadlockDetected { .. })
        ));
        assert!(manager.held_locks(tx(2)).is_empty());

        // Older T1 waits on younger T3.
        manager.acquire(tx(3), b, LockMode::Exclusive).expect("T3 b");
        let older = {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire(tx(1), b, LockMode::Exclusive))
        };
        wait_for_waiters(&manager, b, 1);
        manager.release_all(tx(3));
        older.join().expect("T1 panicked").expect("T1 b");
    }

    #[test]
    fn test_registry() {
        let default = create_lock_manager("", None).expect("default");
        assert_eq!(default.name(), COMMUNITY_LOCK_MANAGER);
        let wait_die = create_lock_manager(WAIT_DIE_LOCK_MANAGER, None).expect("wait-die");
        assert_eq!(wait_die.name(), WAIT_DIE_LOCK_MANAGER);
        assert!(matches!(
            create_lock_manager("distributed", None),
            Err(LockError::UnknownLockManager(name)) if name == "distributed"
        ));
    }
}
