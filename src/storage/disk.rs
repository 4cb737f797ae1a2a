//! Disk access for paged store files.
//!
//! A [`PageSwapper`] moves whole pages between a page cache frame and one
//! backing file. It owns no cache memory and never calls back into the cache;
//! the page cache owns the swapper and drives it. The byte offset of page `i`
//! is always `i * page_size`.
//!
//! The swapper talks to storage through a [`StoreChannel`] so tests can
//! observe exactly which calls reach the file.

pub mod channel;
pub mod swapper;

pub use channel::{FileChannel, StoreChannel};
pub use swapper::{PageSwapper, SingleFilePageSwapper, SingleFileSwapperFactory, SwapperFactory};

/// Default page size for store files.
pub const PAGE_SIZE: usize = 8192;
