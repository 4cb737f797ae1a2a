//! Backing store channels.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Byte-level access to one backing file.
///
/// Writing past the current end of the channel extends it; any gap between the
/// old end and the write offset reads back as zeros.
pub trait StoreChannel: Send {
    /// Current length of the channel in bytes.
    fn size(&mut self) -> io::Result<u64>;

    /// Reads into `buf` starting at `offset`, stopping early only at end of file.
    /// Returns the number of bytes read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `buf` at `offset`.
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Forces written data to stable storage.
    fn force(&mut self) -> io::Result<()>;

    /// Truncates or extends the channel to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

/// A [`StoreChannel`] over a regular file.
pub struct FileChannel {
    file: File,
}

impl FileChannel {
    /// Opens `path`, creating it when `read_only` is false.
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        let file = if read_only {
            OpenOptions::new().read(true).open(path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?
        };
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl StoreChannel for FileChannel {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn force(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_write_past_end_zero_fills_gap() -> Result<()> {
        let dir = tempdir()?;
        let mut channel = FileChannel::open(&dir.path().join("gap.db"), false)?;

        channel.write_all_at(10, &[7, 7])?;
        assert_eq!(channel.size()?, 12);

        let mut buf = [0xffu8; 12];
        assert_eq!(channel.read_at(0, &mut buf)?, 12);
        assert_eq!(&buf[..10], &[0u8; 10]);
        assert_eq!(&buf[10..], &[7, 7]);

        Ok(())
    }

    #[test]
    fn test_short_read_at_end() -> Result<()> {
        let dir = tempdir()?;
        let mut channel = FileChannel::open(&dir.path().join("short.db"), false)?;
        channel.write_all_at(0, &[1, 2, 3])?;

        let mut buf = [0u8; 8];
        assert_eq!(channel.read_at(1, &mut buf)?, 2);
        assert_eq!(&buf[..2], &[2, 3]);

        Ok(())
    }

    #[test]
    fn test_read_only_open_requires_file() {
        let dir = tempdir().unwrap();
        assert!(FileChannel::open(&dir.path().join("missing.db"), true).is_err());
    }
}
