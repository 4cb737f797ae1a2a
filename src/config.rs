//! Store configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::PAGE_SIZE;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub store_dir: PathBuf,
    pub page_size: usize,
    pub cache_frames: usize,
    pub read_only: bool,
    /// Lock manager implementation; empty selects the default.
    pub lock_manager: String,
    /// Longest a lock request waits; `None` waits until granted or aborted.
    pub lock_timeout: Option<Duration>,
    pub compact_log_on_checkpoint: bool,
}

impl StoreConfig {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_cache_frames(mut self, cache_frames: usize) -> Self {
        self.cache_frames = cache_frames;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_lock_manager(mut self, name: impl Into<String>) -> Self {
        self.lock_manager = name.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_compact_log_on_checkpoint(mut self, compact: bool) -> Self {
        self.compact_log_on_checkpoint = compact;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./vibegraph_data"),
            page_size: PAGE_SIZE,
            cache_frames: 64,
            read_only: false,
            lock_manager: String::new(),
            lock_timeout: Some(Duration::from_secs(10)),
            compact_log_on_checkpoint: false,
        }
    }
}
