use std::path::{Path, PathBuf};

use log::debug;

use super::channel::{FileChannel, StoreChannel};
use crate::storage::error::{StorageError, StorageResult};

/// Moves whole pages between memory and one backing file.
pub trait PageSwapper: Send {
    /// Fills `buf` with page `page_index` and returns the number of bytes that
    /// came from the file. Pages at or beyond the end of the file read as zeros
    /// without touching the file.
    fn read(&mut self, page_index: u64, buf: &mut [u8]) -> StorageResult<usize>;

    /// Writes `buf` as page `page_index`, extending the file when needed.
    fn write(&mut self, page_index: u64, buf: &[u8]) -> StorageResult<()>;

    /// Number of pages that hold at least one byte of file data.
    fn file_size_in_pages(&mut self) -> StorageResult<u64>;

    /// Forces written pages to stable storage.
    fn force(&mut self) -> StorageResult<()>;

    /// Forces and releases the backing file.
    fn close(self: Box<Self>) -> StorageResult<()>;

    fn path(&self) -> &Path;

    fn page_size(&self) -> usize;
}

/// Builds swappers for files the page cache maps.
pub trait SwapperFactory: Send + Sync {
    fn create_swapper(&self, path: &Path, page_size: usize)
        -> StorageResult<Box<dyn PageSwapper>>;
}

/// Swapper over a single flat file: page `i` lives at byte `i * page_size`.
pub struct SingleFilePageSwapper<C: StoreChannel = FileChannel> {
    path: PathBuf,
    channel: C,
    page_size: usize,
}

impl<C: StoreChannel> SingleFilePageSwapper<C> {
    pub fn new(path: impl Into<PathBuf>, channel: C, page_size: usize) -> StorageResult<Self> {
        if page_size == 0 {
            return Err(StorageError::InvalidPageSize(page_size));
        }
        Ok(Self {
            path: path.into(),
            channel,
            page_size,
        })
    }

    fn page_offset(&self, page_index: u64) -> u64 {
        page_index * self.page_size as u64
    }

    fn check_buffer(&self, len: usize) -> StorageResult<()> {
        if len != self.page_size {
            return Err(StorageError::InvalidPageSize(len));
        }
        Ok(())
    }

    fn io_failure(&self, source: std::io::Error) -> StorageError {
        StorageError::io_failure(&self.path, source)
    }
}

impl<C: StoreChannel> PageSwapper for SingleFilePageSwapper<C> {
    fn read(&mut self, page_index: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.check_buffer(buf.len())?;

        let offset = self.page_offset(page_index);
        let file_size = self.channel.size().map_err(|e| self.io_failure(e))?;

        if offset >= file_size {
            buf.fill(0);
            return Ok(0);
        }

        // The final page of a file may be partial.
        let available = (file_size - offset).min(self.page_size as u64) as usize;
        let read = self
            .channel
            .read_at(offset, &mut buf[..available])
            .map_err(|e| self.io_failure(e))?;
        buf[read..].fill(0);

        Ok(read)
    }

    fn write(&mut self, page_index: u64, buf: &[u8]) -> StorageResult<()> {
        self.check_buffer(buf.len())?;

        let offset = self.page_offset(page_index);
        self.channel
            .write_all_at(offset, buf)
            .map_err(|e| self.io_failure(e))
    }

    fn file_size_in_pages(&mut self) -> StorageResult<u64> {
        let file_size = self.channel.size().map_err(|e| self.io_failure(e))?;
        Ok(file_size.div_ceil(self.page_size as u64))
    }

    fn force(&mut self) -> StorageResult<()> {
        self.channel.force().map_err(|e| self.io_failure(e))
    }

    fn close(mut self: Box<Self>) -> StorageResult<()> {
        self.force()?;
        debug!("closed page swapper for {:?}", self.path);
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// Factory producing [`SingleFilePageSwapper`]s over regular files.
#[derive(Debug, Clone, Default)]
pub struct SingleFileSwapperFactory {
    read_only: bool,
}

impl SingleFileSwapperFactory {
    pub fn new(read_only: bool) -> Self {
        Self { read_only }
    }
}

impl SwapperFactory for SingleFileSwapperFactory {
    fn create_swapper(
        &self,
        path: &Path,
        page_size: usize,
    ) -> StorageResult<Box<dyn PageSwapper>> {
        let channel =
            FileChannel::open(path, self.read_only).map_err(|e| StorageError::io_failure(path, e))?;
        Ok(Box::new(SingleFilePageSwapper::new(path, channel, page_size)?))
    }
}
