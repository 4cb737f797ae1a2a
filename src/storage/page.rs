use std::fmt;

/// Identity of a file mapped into the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

/// A page of a mapped file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file: FileId,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(file: FileId, page_index: u64) -> Self {
        Self { file, page_index }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file{}:page{}", self.file.0, self.page_index)
    }
}

/// Index of a frame in the page cache.
pub type FrameId = usize;

/// Lifecycle of a page cache frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Holds no page.
    Free,
    /// A swapper read is filling the frame.
    Loading,
    /// Holds a page identical to its on-disk copy.
    Clean,
    /// Holds a page modified since it was last written out.
    Dirty,
    /// Being written out through its swapper.
    Flushing,
    /// Being detached from its page.
    Evicting,
}

/// What a caller intends to do with a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageIntent {
    Read,
    Write,
}
