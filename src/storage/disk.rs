use crate::storage::error::StorageError;
use anyhow::{Context, Result, bail};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const PAGE_SIZE: usize = 8192;

/// Raw page-granular I/O over the database file. Page numbers are 1-based
/// so that a zero page number (and therefore a zero item uid) stays invalid.
pub struct DiskManager {
    file: File,
}

impl DiskManager {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;

        Ok(Self { file })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open file: {:?}", path))?;

        Ok(Self { file })
    }

    pub fn read_page(&mut self, pgno: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            bail!(
                "Buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            );
        }
        if pgno == 0 || pgno > self.page_count()? {
            return Err(StorageError::PageNotFound(pgno).into());
        }

        self.file
            .seek(SeekFrom::Start(Self::page_offset(pgno)))
            .context("Failed to seek")?;
        self.file.read_exact(buf).context("Failed to read page")?;

        Ok(())
    }

    pub fn write_page(&mut self, pgno: u32, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            bail!(
                "Data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            );
        }
        if pgno == 0 {
            return Err(StorageError::PageNotFound(pgno).into());
        }

        let offset = Self::page_offset(pgno);
        let file_size = self.file.metadata()?.len();

        // Extend file if necessary
        if offset + PAGE_SIZE as u64 > file_size {
            self.file
                .set_len(offset + PAGE_SIZE as u64)
                .context("Failed to extend file")?;
        }

        self.file
            .seek(SeekFrom::Start(offset))
            .context("Failed to seek")?;
        self.file.write_all(data).context("Failed to write page")?;
        self.file.sync_all().context("Failed to sync")?;

        Ok(())
    }

    pub fn page_count(&self) -> Result<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as u32)
    }

    /// Extends the file by one page and returns its number.
    pub fn allocate_page(&mut self) -> Result<u32> {
        let pgno = self.page_count()? + 1;
        self.file
            .set_len(pgno as u64 * PAGE_SIZE as u64)
            .context("Failed to extend file")?;

        Ok(pgno)
    }

    /// Shrinks the file so that `pgno` is the last page.
    pub fn truncate(&mut self, pgno: u32) -> Result<()> {
        self.file
            .set_len(pgno as u64 * PAGE_SIZE as u64)
            .context("Failed to truncate file")?;
        self.file.sync_all().context("Failed to sync")?;

        Ok(())
    }

    fn page_offset(pgno: u32) -> u64 {
        (pgno as u64 - 1) * PAGE_SIZE as u64
    }
}
