//! Page cache shared by every paged file of a store.
//!
//! A bounded pool of frames caches pages of mapped files. Callers never see a
//! frame directly: they get a [`PageReadCursor`] or [`PageWriteCursor`] that
//! pins the frame for its lifetime and holds the frame latch.
//!
//! At most one swapper read is in flight per page: the thread that misses
//! tags a frame and takes its write latch before releasing the cache lock, so
//! concurrent acquirers of the same page find the tag, pin the frame, and
//! block on the latch until the load finishes.

pub mod lru;
pub mod replacer;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, MutexGuard, RawRwLock, RwLock};

use crate::storage::disk::{PageSwapper, SwapperFactory};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{FileId, FrameId, FrameState, PageIntent, PageKey};
use replacer::{Replacer, VictimClass};

type ReadLatch = ArcRwLockReadGuard<RawRwLock, Vec<u8>>;
type WriteLatch = ArcRwLockWriteGuard<RawRwLock, Vec<u8>>;

/// A file mapped into the page cache.
///
/// Handles are cheap to clone; every clone names the same mapping.
#[derive(Clone)]
pub struct PagedFile {
    inner: Arc<PagedFileInner>,
}

struct PagedFileInner {
    id: FileId,
    path: PathBuf,
    page_size: usize,
    swapper: Mutex<Option<Box<dyn PageSwapper>>>,
    unusable: AtomicBool,
    map_count: AtomicUsize,
}

impl PagedFile {
    pub fn id(&self) -> FileId {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// True once a flush of this file has failed; writes are refused from then on.
    pub fn is_unusable(&self) -> bool {
        self.inner.unusable.load(Ordering::Acquire)
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.map_count.load(Ordering::Acquire) > 0
    }

    /// Size of the backing file in pages. Pages only present in the cache are
    /// not counted until they are flushed.
    pub fn file_size_in_pages(&self) -> StorageResult<u64> {
        self.inner.with_swapper(|swapper| swapper.file_size_in_pages())
    }
}

impl std::fmt::Debug for PagedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedFile")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("page_size", &self.inner.page_size)
            .finish()
    }
}

impl PagedFileInner {
    fn with_swapper<T>(
        &self,
        f: impl FnOnce(&mut dyn PageSwapper) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut swapper = self.swapper.lock();
        match swapper.as_mut() {
            Some(swapper) => f(swapper.as_mut()),
            None => Err(StorageError::NotMapped(self.path.clone())),
        }
    }

    /// Marks the file unusable and converts `err` into a `StorageFailure`.
    fn fail(&self, err: StorageError) -> StorageError {
        if !self.unusable.swap(true, Ordering::AcqRel) {
            warn!("Paged file {:?} marked unusable: {}", self.path, err);
        }
        StorageError::StorageFailure {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}

/// Snapshot of page cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Swapper reads issued to fill frames.
    pub loads: u64,
    pub evictions: u64,
    /// Dirty pages written back through a swapper.
    pub flushes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

struct Frame {
    buf: Arc<RwLock<Vec<u8>>>,
    dirty: AtomicBool,
}

struct FrameMeta {
    page: Option<PageKey>,
    owner: Option<Arc<PagedFileInner>>,
    pin_count: u32,
    /// Never `Dirty`; dirtiness lives in the frame's flag.
    state: FrameState,
}

impl FrameMeta {
    fn free() -> Self {
        Self {
            page: None,
            owner: None,
            pin_count: 0,
            state: FrameState::Free,
        }
    }
}

struct CacheState {
    page_table: HashMap<PageKey, FrameId>,
    meta: Vec<FrameMeta>,
    free_list: Vec<FrameId>,
    replacer: Box<dyn Replacer>,
}

impl CacheState {
    fn pin(&mut self, frame_id: FrameId) {
        let meta = &mut self.meta[frame_id];
        meta.pin_count += 1;
        if meta.pin_count == 1 {
            self.replacer.pin(frame_id);
        }
    }

    fn unpin(&mut self, frame_id: FrameId) {
        let meta = &mut self.meta[frame_id];
        debug_assert!(meta.pin_count > 0);
        meta.pin_count = meta.pin_count.saturating_sub(1);
        if meta.pin_count == 0 {
            if meta.page.is_some() {
                self.replacer.unpin(frame_id);
            } else {
                self.free_list.push(frame_id);
            }
        }
    }

    /// Untags a frame. The caller decides where the frame goes next.
    fn detach(&mut self, frame_id: FrameId) {
        let meta = &mut self.meta[frame_id];
        if let Some(key) = meta.page.take() {
            self.page_table.remove(&key);
        }
        meta.owner = None;
        meta.state = FrameState::Free;
    }
}

struct CacheInner {
    factory: Arc<dyn SwapperFactory>,
    frames: Vec<Frame>,
    max_page_size: usize,
    state: Mutex<CacheState>,
    files: DashMap<PathBuf, PagedFile>,
    next_file_id: AtomicU32,
    counters: Counters,
}

impl CacheInner {
    fn classify(&self, meta: &[FrameMeta], frame_id: FrameId) -> VictimClass {
        let meta = &meta[frame_id];
        if meta.pin_count > 0 || meta.state != FrameState::Clean {
            return VictimClass::Skip;
        }
        if !self.frames[frame_id].dirty.load(Ordering::Acquire) {
            return VictimClass::Clean;
        }
        match &meta.owner {
            Some(owner) if !owner.unusable.load(Ordering::Acquire) => VictimClass::Dirty,
            _ => VictimClass::Skip,
        }
    }

    fn unpin(&self, frame_id: FrameId) {
        self.state.lock().unpin(frame_id);
    }

    /// Writes a latched dirty frame back through its owner's swapper.
    fn write_back(
        &self,
        frame_id: FrameId,
        data: &[u8],
        owner: &PagedFileInner,
        page_index: u64,
    ) -> StorageResult<()> {
        if owner.unusable.load(Ordering::Acquire) {
            return Err(StorageError::FileUnusable(owner.path.clone()));
        }
        match owner.with_swapper(|swapper| swapper.write(page_index, data)) {
            Ok(()) => {
                self.frames[frame_id].dirty.store(false, Ordering::Release);
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(owner.fail(e)),
        }
    }
}

/// Bounded page cache over any number of mapped files.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<CacheInner>,
}

impl PageCache {
    /// Creates a cache of `frame_count` frames, each able to hold a page of up
    /// to `max_page_size` bytes.
    pub fn new(
        factory: Arc<dyn SwapperFactory>,
        frame_count: usize,
        max_page_size: usize,
    ) -> Self {
        let replacer = Box::new(lru::LruReplacer::new(frame_count));
        Self::with_replacer(factory, frame_count, max_page_size, replacer)
    }

    pub fn with_replacer(
        factory: Arc<dyn SwapperFactory>,
        frame_count: usize,
        max_page_size: usize,
        replacer: Box<dyn Replacer>,
    ) -> Self {
        let frames = (0..frame_count)
            .map(|_| Frame {
                buf: Arc::new(RwLock::new(Vec::new())),
                dirty: AtomicBool::new(false),
            })
            .collect();
        let state = CacheState {
            page_table: HashMap::with_capacity(frame_count),
            meta: (0..frame_count).map(|_| FrameMeta::free()).collect(),
            // Popped from the back: lowest frame ids are handed out first.
            free_list: (0..frame_count).rev().collect(),
            replacer,
        };
        Self {
            inner: Arc::new(CacheInner {
                factory,
                frames,
                max_page_size,
                state: Mutex::new(state),
                files: DashMap::new(),
                next_file_id: AtomicU32::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.inner.frames.len()
    }

    pub fn max_page_size(&self) -> usize {
        self.inner.max_page_size
    }

    /// Maps `path` with the given page size. Mapping an already mapped file
    /// increments its reference count and returns the same handle.
    pub fn map_file(&self, path: &Path, page_size: usize) -> StorageResult<PagedFile> {
        if page_size == 0 || page_size > self.inner.max_page_size {
            return Err(StorageError::InvalidPageSize(page_size));
        }

        let entry = self.inner.files.entry(path.to_path_buf());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let file = occupied.get().clone();
                drop(occupied);
                if file.page_size() != page_size {
                    return Err(StorageError::PageSizeMismatch {
                        path: path.to_path_buf(),
                        mapped: file.page_size(),
                        requested: page_size,
                    });
                }
                file.inner.map_count.fetch_add(1, Ordering::AcqRel);
                Ok(file)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let swapper = self.inner.factory.create_swapper(path, page_size)?;
                let id = FileId(self.inner.next_file_id.fetch_add(1, Ordering::Relaxed));
                let file = PagedFile {
                    inner: Arc::new(PagedFileInner {
                        id,
                        path: path.to_path_buf(),
                        page_size,
                        swapper: Mutex::new(Some(swapper)),
                        unusable: AtomicBool::new(false),
                        map_count: AtomicUsize::new(1),
                    }),
                };
                debug!("Mapped {:?} as file {} (page size {})", path, id.0, page_size);
                vacant.insert(file.clone());
                Ok(file)
            }
        }
    }

    /// Drops one reference to a mapped file. The last reference flushes the
    /// file's dirty pages, drops its frames and closes its swapper.
    pub fn unmap_file(&self, file: &PagedFile) -> StorageResult<()> {
        let previous = file
            .inner
            .map_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| StorageError::NotMapped(file.path().to_path_buf()))?;
        if previous > 1 {
            return Ok(());
        }

        if let Err(e) = self.release_file(file) {
            file.inner.map_count.fetch_add(1, Ordering::AcqRel);
            return Err(e);
        }
        self.inner
            .files
            .remove_if(file.path(), |_, mapped| mapped.id() == file.id());
        let swapper = file.inner.swapper.lock().take();
        if let Some(swapper) = swapper {
            swapper.close()?;
        }
        debug!("Unmapped {:?}", file.path());
        Ok(())
    }

    fn release_file(&self, file: &PagedFile) -> StorageResult<()> {
        loop {
            self.flush_file(file)?;

            let mut state = self.inner.state.lock();
            let owned: Vec<FrameId> = (0..state.meta.len())
                .filter(|&fid| state.meta[fid].page.map(|p| p.file) == Some(file.id()))
                .collect();
            if owned.iter().any(|&fid| state.meta[fid].pin_count > 0) {
                return Err(StorageError::FileInUse(file.path().to_path_buf()));
            }
            if owned
                .iter()
                .any(|&fid| self.inner.frames[fid].dirty.load(Ordering::Acquire))
            {
                // Dirtied again since the flush.
                continue;
            }
            for fid in owned {
                state.replacer.pin(fid);
                state.detach(fid);
                state.free_list.push(fid);
            }
            return Ok(());
        }
    }

    /// Pins `page_index` of `file` and returns a cursor with the requested intent.
    pub fn acquire_page(
        &self,
        file: &PagedFile,
        page_index: u64,
        intent: PageIntent,
    ) -> StorageResult<PageCursor> {
        match intent {
            PageIntent::Read => self.fetch_page(file, page_index).map(PageCursor::Read),
            PageIntent::Write => self
                .fetch_page_write(file, page_index)
                .map(PageCursor::Write),
        }
    }

    pub fn fetch_page(&self, file: &PagedFile, page_index: u64) -> StorageResult<PageReadCursor> {
        let (frame_id, latch) = self.pin_page(file, page_index, PageIntent::Read)?;
        let guard = match latch {
            Latch::Read(guard) => guard,
            Latch::Write(guard) => {
                drop(guard);
                self.inner.frames[frame_id].buf.read_arc()
            }
        };
        Ok(PageReadCursor {
            cache: self.inner.clone(),
            frame_id,
            page: PageKey::new(file.id(), page_index),
            guard: Some(guard),
        })
    }

    pub fn fetch_page_write(
        &self,
        file: &PagedFile,
        page_index: u64,
    ) -> StorageResult<PageWriteCursor> {
        let (frame_id, latch) = self.pin_page(file, page_index, PageIntent::Write)?;
        let guard = match latch {
            Latch::Write(guard) => guard,
            Latch::Read(guard) => {
                drop(guard);
                self.inner.frames[frame_id].buf.write_arc()
            }
        };
        Ok(PageWriteCursor {
            cache: self.inner.clone(),
            frame_id,
            page: PageKey::new(file.id(), page_index),
            guard: Some(guard),
            marked_dirty: false,
        })
    }

    fn latch(&self, frame_id: FrameId, intent: PageIntent) -> Latch {
        let buf = &self.inner.frames[frame_id].buf;
        match intent {
            PageIntent::Read => Latch::Read(buf.read_arc()),
            PageIntent::Write => Latch::Write(buf.write_arc()),
        }
    }

    fn pin_page(
        &self,
        file: &PagedFile,
        page_index: u64,
        intent: PageIntent,
    ) -> StorageResult<(FrameId, Latch)> {
        let key = PageKey::new(file.id(), page_index);
        let mut flush_error = None;

        loop {
            if !file.is_mapped() {
                return Err(StorageError::NotMapped(file.path().to_path_buf()));
            }
            if intent == PageIntent::Write && file.is_unusable() {
                return Err(StorageError::FileUnusable(file.path().to_path_buf()));
            }

            let mut state = self.inner.state.lock();

            let cached = state.page_table.get(&key).copied();
            if let Some(frame_id) = cached {
                state.pin(frame_id);
                drop(state);

                // Blocks behind an in-flight load or write-back of this frame.
                let latch = self.latch(frame_id, intent);
                let state = self.inner.state.lock();
                if state.meta[frame_id].page == Some(key) {
                    drop(state);
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok((frame_id, latch));
                }
                // The load we waited for failed; try again from scratch.
                drop(state);
                drop(latch);
                self.inner.unpin(frame_id);
                continue;
            }

            let frame_id = match state.free_list.pop() {
                Some(frame_id) => frame_id,
                None => match self.pick_victim(&mut state) {
                    Some(frame_id) => frame_id,
                    None => {
                        return Err(flush_error.take().unwrap_or(StorageError::CacheExhausted {
                            frames: self.inner.frames.len(),
                        }))
                    }
                },
            };

            if self.inner.frames[frame_id].dirty.load(Ordering::Acquire) {
                match self.evict_dirty(state, frame_id) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        flush_error = Some(e);
                        continue;
                    }
                }
                state = self.inner.state.lock();
                if state.page_table.contains_key(&key) {
                    // Someone else loaded the page while we were flushing.
                    state.free_list.push(frame_id);
                    continue;
                }
            } else if state.meta[frame_id].page.is_some() {
                state.detach(frame_id);
                self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }

            let Some(latch) = self.inner.frames[frame_id].buf.try_write_arc() else {
                // A latch outlived its pin; leave the frame for later.
                state.free_list.push(frame_id);
                drop(state);
                std::thread::yield_now();
                continue;
            };

            let meta = &mut state.meta[frame_id];
            meta.page = Some(key);
            meta.owner = Some(file.inner.clone());
            meta.state = FrameState::Loading;
            state.page_table.insert(key, frame_id);
            state.pin(frame_id);
            drop(state);

            self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
            return self
                .load(file, frame_id, key, latch)
                .map(|latch| (frame_id, latch));
        }
    }

    /// Picks an unpinned victim, preferring clean frames.
    fn pick_victim(&self, state: &mut MutexGuard<'_, CacheState>) -> Option<FrameId> {
        let CacheState { replacer, meta, .. } = &mut **state;
        let meta: &[FrameMeta] = meta;
        let inner = &self.inner;
        replacer.victim(&|frame_id| inner.classify(meta, frame_id))
    }

    /// Writes back a dirty victim that the replacer already released.
    ///
    /// Returns `Ok(true)` when the frame was detached and is ours to reuse,
    /// `Ok(false)` when another thread pinned it during the write.
    fn evict_dirty(
        &self,
        mut state: MutexGuard<'_, CacheState>,
        frame_id: FrameId,
    ) -> StorageResult<bool> {
        let Some(latch) = self.inner.frames[frame_id].buf.try_write_arc() else {
            state.replacer.unpin(frame_id);
            return Ok(false);
        };
        let (owner, page) = {
            let meta = &mut state.meta[frame_id];
            meta.state = FrameState::Flushing;
            meta.pin_count = 1;
            (meta.owner.clone(), meta.page)
        };
        drop(state);

        let result = match (&owner, page) {
            (Some(owner), Some(page)) => {
                self.inner
                    .write_back(frame_id, &latch, owner, page.page_index)
            }
            _ => Ok(()),
        };
        drop(latch);

        let mut state = self.inner.state.lock();
        state.meta[frame_id].state = FrameState::Clean;
        match result {
            Ok(()) if state.meta[frame_id].pin_count == 1 => {
                state.meta[frame_id].pin_count = 0;
                state.detach(frame_id);
                self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Ok(()) => {
                state.unpin(frame_id);
                Ok(false)
            }
            Err(e) => {
                state.unpin(frame_id);
                Err(e)
            }
        }
    }

    fn load(
        &self,
        file: &PagedFile,
        frame_id: FrameId,
        key: PageKey,
        mut latch: WriteLatch,
    ) -> StorageResult<Latch> {
        latch.clear();
        latch.resize(file.page_size(), 0);
        self.inner.frames[frame_id]
            .dirty
            .store(false, Ordering::Release);

        self.inner.counters.loads.fetch_add(1, Ordering::Relaxed);
        let result = file
            .inner
            .with_swapper(|swapper| swapper.read(key.page_index, &mut latch));

        let mut state = self.inner.state.lock();
        match result {
            Ok(_) => {
                state.meta[frame_id].state = FrameState::Clean;
                Ok(Latch::Write(latch))
            }
            Err(e) => {
                state.detach(frame_id);
                drop(latch);
                state.unpin(frame_id);
                Err(e)
            }
        }
    }

    /// Writes every dirty page of `file` through its swapper and forces the
    /// file. A failure marks the file unusable.
    pub fn flush_file(&self, file: &PagedFile) -> StorageResult<()> {
        let targets: Vec<(FrameId, u64)> = {
            let mut state = self.inner.state.lock();
            let targets: Vec<(FrameId, u64)> = state
                .meta
                .iter()
                .enumerate()
                .filter(|(fid, meta)| {
                    meta.state == FrameState::Clean
                        && self.inner.frames[*fid].dirty.load(Ordering::Acquire)
                })
                .filter_map(|(fid, meta)| match meta.page {
                    Some(page) if page.file == file.id() => Some((fid, page.page_index)),
                    _ => None,
                })
                .collect();
            for &(fid, _) in &targets {
                state.pin(fid);
                state.meta[fid].state = FrameState::Flushing;
            }
            targets
        };

        let mut first_error = None;
        for (frame_id, page_index) in targets {
            let result = {
                let guard = self.inner.frames[frame_id].buf.read();
                if first_error.is_none() && self.inner.frames[frame_id].dirty.load(Ordering::Acquire) {
                    self.inner
                        .write_back(frame_id, &guard, &file.inner, page_index)
                } else {
                    Ok(())
                }
            };
            {
                let mut state = self.inner.state.lock();
                state.meta[frame_id].state = FrameState::Clean;
                state.unpin(frame_id);
            }
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if file.is_unusable() {
            return Ok(());
        }
        file.inner
            .with_swapper(|swapper| swapper.force())
            .map_err(|e| file.inner.fail(e))
    }

    /// Flushes and forces every mapped file. Every file is attempted; the
    /// first failure is returned.
    pub fn flush_all(&self) -> StorageResult<()> {
        let files: Vec<PagedFile> = self.inner.files.iter().map(|e| e.value().clone()).collect();
        let mut first_error = None;
        for file in &files {
            if let Err(e) = self.flush_file(file) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Evicts the page held by `frame_id`, writing it back first if dirty.
    /// Returns false when the frame is free or pinned.
    pub fn evict_frame(&self, frame_id: FrameId) -> StorageResult<bool> {
        let mut state = self.inner.state.lock();
        let Some(meta) = state.meta.get(frame_id) else {
            return Ok(false);
        };
        if meta.page.is_none() || meta.pin_count > 0 || meta.state != FrameState::Clean {
            return Ok(false);
        }
        state.replacer.pin(frame_id);

        if self.inner.frames[frame_id].dirty.load(Ordering::Acquire) {
            if !self.evict_dirty(state, frame_id)? {
                return Ok(false);
            }
            state = self.inner.state.lock();
        } else {
            state.meta[frame_id].state = FrameState::Evicting;
            state.detach(frame_id);
            self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        state.free_list.push(frame_id);
        Ok(true)
    }

    /// Evicts a page if it is cached and unpinned.
    pub fn evict_page(&self, file: &PagedFile, page_index: u64) -> StorageResult<bool> {
        let frame_id = {
            let state = self.inner.state.lock();
            state.page_table.get(&PageKey::new(file.id(), page_index)).copied()
        };
        match frame_id {
            Some(frame_id) => self.evict_frame(frame_id),
            None => Ok(false),
        }
    }

    /// Frame currently caching the page, if any.
    pub fn frame_of(&self, file: &PagedFile, page_index: u64) -> Option<FrameId> {
        let state = self.inner.state.lock();
        state.page_table.get(&PageKey::new(file.id(), page_index)).copied()
    }

    pub fn frame_state(&self, frame_id: FrameId) -> Option<FrameState> {
        let state = self.inner.state.lock();
        let meta = state.meta.get(frame_id)?;
        if meta.state == FrameState::Clean && self.inner.frames[frame_id].dirty.load(Ordering::Acquire) {
            return Some(FrameState::Dirty);
        }
        Some(meta.state)
    }

    pub fn pin_count(&self, frame_id: FrameId) -> u32 {
        let state = self.inner.state.lock();
        state.meta.get(frame_id).map_or(0, |meta| meta.pin_count)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
        }
    }

    /// Flushes everything and closes every mapped file regardless of its
    /// reference count.
    pub fn close(&self) -> StorageResult<()> {
        self.flush_all()?;
        let files: Vec<PagedFile> = self.inner.files.iter().map(|e| e.value().clone()).collect();
        for file in files {
            file.inner.map_count.store(1, Ordering::Release);
            self.unmap_file(&file)?;
        }
        info!("Page cache closed ({:?})", self.stats());
        Ok(())
    }
}

enum Latch {
    Read(ReadLatch),
    Write(WriteLatch),
}

/// Shared access to a pinned page.
pub struct PageReadCursor {
    cache: Arc<CacheInner>,
    frame_id: FrameId,
    page: PageKey,
    guard: Option<ReadLatch>,
}

impl PageReadCursor {
    pub fn page_index(&self) -> u64 {
        self.page.page_index
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageReadCursor {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.guard.as_deref() {
            Some(buf) => buf.as_slice(),
            None => &[],
        }
    }
}

impl Drop for PageReadCursor {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.cache.unpin(self.frame_id);
    }
}

/// Exclusive access to a pinned page. The frame becomes dirty on the first
/// mutable access.
pub struct PageWriteCursor {
    cache: Arc<CacheInner>,
    frame_id: FrameId,
    page: PageKey,
    guard: Option<WriteLatch>,
    marked_dirty: bool,
}

impl PageWriteCursor {
    pub fn page_index(&self) -> u64 {
        self.page.page_index
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageWriteCursor {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.guard.as_deref() {
            Some(buf) => buf.as_slice(),
            None => &[],
        }
    }
}

impl DerefMut for PageWriteCursor {
    fn deref_mut(&mut self) -> &mut [u8] {
        if !self.marked_dirty {
            self.cache.frames[self.frame_id]
                .dirty
                .store(true, Ordering::Release);
            self.marked_dirty = true;
        }
        match self.guard.as_deref_mut() {
            Some(buf) => buf.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl Drop for PageWriteCursor {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.cache.unpin(self.frame_id);
    }
}

/// Cursor returned by [`PageCache::acquire_page`].
pub enum PageCursor {
    Read(PageReadCursor),
    Write(PageWriteCursor),
}

impl PageCursor {
    pub fn page_index(&self) -> u64 {
        match self {
            PageCursor::Read(cursor) => cursor.page_index(),
            PageCursor::Write(cursor) => cursor.page_index(),
        }
    }

    /// Mutable access, available only for write cursors.
    pub fn as_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            PageCursor::Read(_) => None,
            PageCursor::Write(cursor) => Some(&mut **cursor),
        }
    }
}

impl Deref for PageCursor {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageCursor::Read(cursor) => &**cursor,
            PageCursor::Write(cursor) => &**cursor,
        }
    }
}
