//! Applies command batches to the page-cached store files.
//!
//! The same applier serves normal commits and recovery replay, so a replayed
//! batch goes through exactly the page mutations the original commit made.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

use super::command::{Command, Mutation, StoreFile};
use super::error::TransactionError;
use crate::schema::{SchemaRule, SCHEMA_SLOT_SIZE};
use crate::storage::buffer::{PageCache, PagedFile};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::LogPosition;

struct MappedStoreFile {
    paged: PagedFile,
    /// Highest byte written so far; whole pages once the file is on disk.
    len: AtomicU64,
}

/// Writes commands into store files through the page cache.
pub struct StoreApplier {
    cache: PageCache,
    store_dir: PathBuf,
    page_size: usize,
    files: DashMap<StoreFile, Arc<MappedStoreFile>>,
}

impl StoreApplier {
    pub fn new(cache: PageCache, store_dir: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            cache,
            store_dir: store_dir.into(),
            page_size,
            files: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Applies `commands` strictly in order.
    pub fn apply(&self, commands: &[Command]) -> StorageResult<()> {
        for command in commands {
            let mutation = command.to_mutation().map_err(|e| match e {
                TransactionError::OutOfRange { offset, len, .. } => {
                    StorageError::OutOfRange { offset, len }
                }
                other => StorageError::Serialization(other.to_string()),
            })?;
            match mutation {
                Mutation::Write {
                    file,
                    offset,
                    bytes,
                } => {
                    let target = self.mapped(&file)?;
                    self.write_span(&target, offset, bytes.len() as u64, |dst, from| {
                        dst.copy_from_slice(&bytes[from..from + dst.len()])
                    })?;
                }
                Mutation::Fill {
                    file,
                    offset,
                    len,
                    value,
                } => {
                    let target = self.mapped(&file)?;
                    self.write_span(&target, offset, len, |dst, _| dst.fill(value))?;
                }
            }
        }
        Ok(())
    }

    /// Reads `len` bytes at `offset`; bytes never written read as zero.
    pub fn read_bytes(&self, file: &StoreFile, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let spans = page_spans(offset, len as u64, self.page_size)?;
        let mut out = vec![0u8; len];
        if len == 0 || !self.exists(file) {
            return Ok(out);
        }
        let target = self.mapped(file)?;
        for span in spans {
            let cursor = self.cache.fetch_page(&target.paged, span.page_index)?;
            out[span.src..span.src + span.len]
                .copy_from_slice(&cursor[span.in_page..span.in_page + span.len]);
        }
        Ok(out)
    }

    /// Logical length of a store file.
    pub fn file_len(&self, file: &StoreFile) -> StorageResult<u64> {
        if !self.exists(file) {
            return Ok(0);
        }
        Ok(self.mapped(file)?.len.load(Ordering::Acquire))
    }

    /// Every rule currently stored in the schema store, by ascending id.
    pub fn schema_rules(&self) -> StorageResult<Vec<SchemaRule>> {
        let schema = StoreFile::schema();
        let len = self.file_len(&schema)?;
        let slots = len / SCHEMA_SLOT_SIZE as u64;
        let mut rules = Vec::new();
        for id in 0..slots {
            let offset = SchemaRule::slot_offset(id).ok_or(StorageError::OutOfRange {
                offset: len,
                len: SCHEMA_SLOT_SIZE as u64,
            })?;
            let slot = self.read_bytes(&schema, offset, SCHEMA_SLOT_SIZE)?;
            let decoded = SchemaRule::decode_slot(id, &slot)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            rules.extend(decoded);
        }
        Ok(rules)
    }

    /// Unmaps every store file. Dirty pages are flushed by the last unmap.
    pub fn close(&self) -> StorageResult<()> {
        let mapped: Vec<StoreFile> = self.files.iter().map(|e| e.key().clone()).collect();
        let mut first_error = None;
        for name in mapped {
            if let Some((_, file)) = self.files.remove(&name) {
                if let Err(e) = self.cache.unmap_file(&file.paged) {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn exists(&self, file: &StoreFile) -> bool {
        self.files.contains_key(file) || self.store_dir.join(file.name()).exists()
    }

    fn mapped(&self, file: &StoreFile) -> StorageResult<Arc<MappedStoreFile>> {
        if let Some(found) = self.files.get(file) {
            return Ok(Arc::clone(found.value()));
        }
        let entry = self.files.entry(file.clone()).or_try_insert_with(|| {
            let path = self.store_dir.join(file.name());
            let len = match std::fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => 0,
                Err(e) => return Err(StorageError::io_failure(&path, e)),
            };
            let paged = self.cache.map_file(&path, self.page_size)?;
            debug!("mapped store file {} ({} bytes)", file, len);
            Ok(Arc::new(MappedStoreFile {
                paged,
                len: AtomicU64::new(len),
            }))
        })?;
        Ok(Arc::clone(entry.value()))
    }

    fn write_span(
        &self,
        target: &MappedStoreFile,
        offset: u64,
        len: u64,
        mut write: impl FnMut(&mut [u8], usize),
    ) -> StorageResult<()> {
        let end = offset
            .checked_add(len)
            .ok_or(StorageError::OutOfRange { offset, len })?;
        for span in page_spans(offset, len, self.page_size)? {
            let mut cursor = self.cache.fetch_page_write(&target.paged, span.page_index)?;
            write(&mut cursor[span.in_page..span.in_page + span.len], span.src);
        }
        target.len.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }
}

/// The part of a byte range that falls into one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageSpan {
    page_index: u64,
    in_page: usize,
    /// Offset of this span within the whole range.
    src: usize,
    len: usize,
}

fn page_spans(
    offset: u64,
    len: u64,
    page_size: usize,
) -> StorageResult<impl Iterator<Item = PageSpan>> {
    let end = offset
        .checked_add(len)
        .ok_or(StorageError::OutOfRange { offset, len })?;
    let page_size = page_size as u64;
    let mut at = offset;
    Ok(std::iter::from_fn(move || {
        if at >= end {
            return None;
        }
        let in_page = at % page_size;
        let chunk = (page_size - in_page).min(end - at);
        let span = PageSpan {
            page_index: at / page_size,
            in_page: in_page as usize,
            src: (at - offset) as usize,
            len: chunk as usize,
        };
        at += chunk;
        Some(span)
    }))
}

/// Tracks which log positions have been applied to the store.
///
/// Commits finish applying out of order; a checkpoint may only claim the
/// highest position below which every position is applied.
#[derive(Debug)]
pub struct AppliedPositions {
    inner: Mutex<AppliedInner>,
}

#[derive(Debug)]
struct AppliedInner {
    contiguous: LogPosition,
    pending: BTreeSet<u64>,
}

impl AppliedPositions {
    /// Starts with every position up to `applied` already applied.
    pub fn starting_at(applied: LogPosition) -> Self {
        Self {
            inner: Mutex::new(AppliedInner {
                contiguous: applied,
                pending: BTreeSet::new(),
            }),
        }
    }

    pub fn mark_applied(&self, position: LogPosition) {
        let mut inner = self.inner.lock();
        if position <= inner.contiguous {
            return;
        }
        inner.pending.insert(position.0);
        loop {
            let next = inner.contiguous.next();
            if !inner.pending.remove(&next.0) {
                break;
            }
            inner.contiguous = next;
        }
    }

    /// Highest position at or below which everything is applied.
    pub fn contiguous(&self) -> LogPosition {
        self.inner.lock().contiguous
    }
}
