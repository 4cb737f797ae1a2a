use std::fmt::Debug;

pub use crate::storage::page::FrameId;

/// How an evictable frame ranks as a victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimClass {
    /// Can be reused without I/O.
    Clean,
    /// Must be flushed before reuse.
    Dirty,
    /// Must not be chosen right now.
    Skip,
}

pub trait Replacer: Send + Sync + Debug {
    /// Select and remove a frame to evict, preferring clean frames over dirty
    /// ones. Returns None if no frame can be evicted.
    fn victim(&mut self, classify: &dyn Fn(FrameId) -> VictimClass) -> Option<FrameId>;

    /// Mark a frame as pinned (not evictable).
    fn pin(&mut self, frame_id: FrameId);

    /// Mark a frame as unpinned (evictable).
    fn unpin(&mut self, frame_id: FrameId);

    /// Get the number of evictable frames.
    fn size(&self) -> usize;
}
