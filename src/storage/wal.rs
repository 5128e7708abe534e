//! Write-ahead log file.
//!
//! Layout: `[xchecksum:4]` followed by records of `[size:4][checksum:4][data]`,
//! all integers little-endian. A record's checksum folds its data; the
//! aggregate xchecksum at offset 0 folds every whole record in append order.
//! Bytes past the last record that validates are the bad tail: the remains
//! of a write that never finished, dropped at open.

use crate::storage::error::StorageError;
use anyhow::{Context, Result};
use bytes::BufMut;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const SEED: u32 = 13331;
const XCHECKSUM_SIZE: u64 = 4;
const RECORD_HEADER_SIZE: u64 = 8;
const SIZE_OFFSET: usize = 0;
const CHECKSUM_OFFSET: usize = 4;
const DATA_OFFSET: usize = 8;

/// Seed-folding checksum; each byte is sign-extended to 32 bits and the
/// accumulator wraps.
fn fold(checksum: u32, data: &[u8]) -> u32 {
    let mut c = checksum;
    for &b in data {
        c = c.wrapping_mul(SEED).wrapping_add(b as i8 as u32);
    }
    c
}

#[derive(Debug)]
struct WalInner {
    file: File,
    // Read cursor of the one-shot iterator, an absolute file offset.
    position: u64,
    file_size: u64,
    xchecksum: u32,
}

/// Single-writer append-only log. `log` and `truncate` serialize on one
/// mutex; iteration shares it and is meant to run before writes begin.
#[derive(Debug)]
pub struct Wal {
    inner: Mutex<WalInner>,
}

impl Wal {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create log file: {:?}", path))?;

        file.write_all(&0u32.to_le_bytes())
            .context("Failed to write log header")?;
        file.sync_all().context("Failed to sync")?;

        Ok(Self {
            inner: Mutex::new(WalInner {
                file,
                position: XCHECKSUM_SIZE,
                file_size: XCHECKSUM_SIZE,
                xchecksum: 0,
            }),
        })
    }

    /// Opens an existing log, validates every record against the stored
    /// aggregate checksum, and truncates the bad tail. The iterator is left
    /// rewound.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {:?}", path))?;

        let file_size = file.metadata()?.len();
        if file_size < XCHECKSUM_SIZE {
            return Err(StorageError::BadLogFile.into());
        }

        file.seek(SeekFrom::Start(0)).context("Failed to seek")?;
        let mut header = [0u8; 4];
        file.read_exact(&mut header)
            .context("Failed to read log header")?;
        let xchecksum = u32::from_le_bytes(header);

        let mut inner = WalInner {
            file,
            position: XCHECKSUM_SIZE,
            file_size,
            xchecksum,
        };
        Self::check_and_remove_tail(&mut inner)?;

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    fn check_and_remove_tail(inner: &mut WalInner) -> Result<()> {
        inner.position = XCHECKSUM_SIZE;

        let mut xcheck = 0u32;
        while let Some(record) = Self::next_record(inner)? {
            xcheck = fold(xcheck, &record);
        }
        if xcheck != inner.xchecksum {
            return Err(StorageError::BadLogFile.into());
        }

        if inner.position < inner.file_size {
            tracing::warn!(
                dropped = inner.file_size - inner.position,
                "truncating bad tail of log file"
            );
            inner
                .file
                .set_len(inner.position)
                .context("Failed to truncate log file")?;
            inner.file.sync_all().context("Failed to sync")?;
            inner.file_size = inner.position;
        }
        inner.position = XCHECKSUM_SIZE;

        Ok(())
    }

    /// Appends one record and makes it durable: the record is written at
    /// the end of the file, then the refreshed aggregate checksum is
    /// rewritten at offset 0 and fsynced.
    pub fn log(&self, data: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(DATA_OFFSET + data.len());
        record.put_u32_le(data.len() as u32);
        record.put_u32_le(fold(0, data));
        record.put_slice(data);

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner
            .file
            .seek(SeekFrom::Start(inner.file_size))
            .context("Failed to seek")?;
        inner
            .file
            .write_all(&record)
            .context("Failed to append log record")?;
        inner.file_size += record.len() as u64;

        inner.xchecksum = fold(inner.xchecksum, &record);
        let xchecksum = inner.xchecksum;
        inner.file.seek(SeekFrom::Start(0)).context("Failed to seek")?;
        inner
            .file
            .write_all(&xchecksum.to_le_bytes())
            .context("Failed to update log checksum")?;
        inner.file.sync_all().context("Failed to sync")?;

        Ok(())
    }

    pub fn rewind(&self) {
        self.inner.lock().position = XCHECKSUM_SIZE;
    }

    /// Yields the next record's data, or None at the end of the log. A
    /// short header, a size running past end-of-file, or a checksum
    /// mismatch all end iteration.
    pub fn next(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        Ok(Self::next_record(&mut inner)?.map(|record| record[DATA_OFFSET..].to_vec()))
    }

    // Reads the whole record (header included) at the cursor, validating
    // its checksum; advances the cursor only on success.
    fn next_record(inner: &mut WalInner) -> Result<Option<Vec<u8>>> {
        if inner.position + RECORD_HEADER_SIZE >= inner.file_size {
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        inner
            .file
            .seek(SeekFrom::Start(inner.position))
            .context("Failed to seek")?;
        inner
            .file
            .read_exact(&mut header)
            .context("Failed to read record header")?;

        let size = u32::from_le_bytes(header[SIZE_OFFSET..CHECKSUM_OFFSET].try_into().unwrap());
        let checksum =
            u32::from_le_bytes(header[CHECKSUM_OFFSET..DATA_OFFSET].try_into().unwrap());
        if inner.position + RECORD_HEADER_SIZE + size as u64 > inner.file_size {
            return Ok(None);
        }

        let mut record = vec![0u8; DATA_OFFSET + size as usize];
        record[..DATA_OFFSET].copy_from_slice(&header);
        inner
            .file
            .read_exact(&mut record[DATA_OFFSET..])
            .context("Failed to read record data")?;

        if fold(0, &record[DATA_OFFSET..]) != checksum {
            return Ok(None);
        }

        inner.position += record.len() as u64;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fold() {
        assert_eq!(fold(0, &[]), 0);
        assert_eq!(fold(0, &[0x01]), 1);
        assert_eq!(fold(0, &[0x01, 0x02]), SEED + 2);
        // Bytes are sign-extended.
        assert_eq!(fold(0, &[0xFF]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_log_and_iterate() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        let wal = Wal::create(&path)?;
        wal.log(&[0x01])?;
        wal.log(&[0x02, 0x03])?;
        drop(wal);

        let wal = Wal::open(&path)?;
        assert_eq!(wal.next()?, Some(vec![0x01]));
        assert_eq!(wal.next()?, Some(vec![0x02, 0x03]));
        assert_eq!(wal.next()?, None);

        // Rewind restarts iteration.
        wal.rewind();
        assert_eq!(wal.next()?, Some(vec![0x01]));

        Ok(())
    }

    #[test]
    fn test_bad_tail_is_truncated() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        {
            let wal = Wal::create(&path)?;
            wal.log(&[0x01])?;
            wal.log(&[0x02, 0x03])?;
        }
        let clean_len = std::fs::metadata(&path)?.len();
        assert_eq!(clean_len, 4 + 9 + 10);
        let clean_bytes = std::fs::read(&path)?;

        // A crashed append leaves garbage after the last record.
        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(&[0xFF, 0xFF, 0xFF])?;
        }

        let wal = Wal::open(&path)?;
        assert_eq!(wal.next()?, Some(vec![0x01]));
        assert_eq!(wal.next()?, Some(vec![0x02, 0x03]));
        assert_eq!(wal.next()?, None);
        drop(wal);

        assert_eq!(std::fs::metadata(&path)?.len(), clean_len);
        assert_eq!(std::fs::read(&path)?, clean_bytes);

        Ok(())
    }

    #[test]
    fn test_appending_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        {
            let wal = Wal::create(&path)?;
            wal.log(b"first")?;
        }
        {
            let wal = Wal::open(&path)?;
            wal.log(b"second")?;
        }

        let wal = Wal::open(&path)?;
        assert_eq!(wal.next()?, Some(b"first".to_vec()));
        assert_eq!(wal.next()?, Some(b"second".to_vec()));
        assert_eq!(wal.next()?, None);

        Ok(())
    }

    #[test]
    fn test_corrupt_record_body_fails_open() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");

        {
            let wal = Wal::create(&path)?;
            wal.log(&[0x01])?;
            wal.log(&[0x02, 0x03])?;
        }

        // Corrupting an interior record is not a tail condition: the
        // aggregate checksum no longer matches the records that validate.
        {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(4 + 8))?;
            file.write_all(&[0x7F])?;
        }

        let err = Wal::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::BadLogFile)
        ));

        Ok(())
    }

    #[test]
    fn test_empty_file_fails_open() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.log");
        std::fs::write(&path, [0u8; 2])?;

        let err = Wal::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::BadLogFile)
        ));

        Ok(())
    }
}
