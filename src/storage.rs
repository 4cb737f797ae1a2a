//! Storage layer for vibegraph.
//!
//! Everything that touches disk goes through this module:
//!
//! - **Swappers** (`disk`): move fixed-size pages between frames and one backing file
//! - **Page cache** (`buffer`): bounded pool of frames shared by every mapped file
//! - **Log** (`wal`): append-only transaction log, the durability boundary
//! - **Meta** (`meta`): store identity and the last checkpoint marker

pub mod buffer;
pub mod disk;
pub mod error;
pub mod meta;
pub mod page;
pub mod wal;

pub use buffer::{CacheStats, PageCache, PageCursor, PageReadCursor, PageWriteCursor, PagedFile};
pub use disk::{PageSwapper, SingleFileSwapperFactory, SwapperFactory, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use meta::{StoreId, StoreMeta};
pub use page::{FileId, FrameId, FrameState, PageIntent, PageKey};
pub use wal::{LogPosition, WalManager};
