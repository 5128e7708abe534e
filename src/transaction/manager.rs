//! Durable transaction status table.
//!
//! The xid file is an 8-byte little-endian xid counter followed by one
//! status byte per xid. Recovery classifies every logged mutation through
//! this table: records of non-active xids are redone, records of active
//! xids are undone.

use super::id::{Xid, XidStatus};
use crate::storage::error::StorageError;
use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const COUNTER_SIZE: u64 = 8;

#[derive(Debug)]
struct XidInner {
    file: File,
    counter: u64,
}

/// Allocates xids and tracks their durable status.
#[derive(Debug)]
pub struct XidManager {
    inner: Mutex<XidInner>,
}

impl XidManager {
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to create xid file: {:?}", path))?;

        file.write_all(&0u64.to_le_bytes())
            .context("Failed to write xid counter")?;
        file.sync_all().context("Failed to sync")?;

        Ok(Self {
            inner: Mutex::new(XidInner { file, counter: 0 }),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open xid file: {:?}", path))?;

        let file_size = file.metadata()?.len();
        if file_size < COUNTER_SIZE {
            return Err(StorageError::BadXidFile.into());
        }

        file.seek(SeekFrom::Start(0)).context("Failed to seek")?;
        let mut header = [0u8; COUNTER_SIZE as usize];
        file.read_exact(&mut header)
            .context("Failed to read xid counter")?;
        let counter = u64::from_le_bytes(header);

        if file_size != COUNTER_SIZE + counter {
            return Err(StorageError::BadXidFile.into());
        }

        Ok(Self {
            inner: Mutex::new(XidInner { file, counter }),
        })
    }

    /// Starts a new transaction in the Active state.
    pub fn begin(&self) -> Result<Xid> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let xid = Xid(inner.counter + 1);

        Self::write_status(&mut inner.file, xid, XidStatus::Active)?;
        inner.counter = xid.0;
        inner
            .file
            .seek(SeekFrom::Start(0))
            .context("Failed to seek")?;
        inner
            .file
            .write_all(&inner.counter.to_le_bytes())
            .context("Failed to update xid counter")?;
        inner.file.sync_all().context("Failed to sync")?;

        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        self.set_status(xid, XidStatus::Committed)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        self.set_status(xid, XidStatus::Aborted)
    }

    pub fn status(&self, xid: Xid) -> Result<XidStatus> {
        if xid.is_super() {
            return Ok(XidStatus::Committed);
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if xid.0 > inner.counter {
            bail!("Xid {} was never allocated", xid.0);
        }

        inner
            .file
            .seek(SeekFrom::Start(Self::slot(xid)))
            .context("Failed to seek")?;
        let mut b = [0u8; 1];
        inner
            .file
            .read_exact(&mut b)
            .context("Failed to read xid status")?;

        XidStatus::from_byte(b[0]).ok_or_else(|| StorageError::BadXidFile.into())
    }

    pub fn is_active(&self, xid: Xid) -> Result<bool> {
        Ok(self.status(xid)? == XidStatus::Active)
    }

    pub fn is_committed(&self, xid: Xid) -> Result<bool> {
        Ok(self.status(xid)? == XidStatus::Committed)
    }

    pub fn is_aborted(&self, xid: Xid) -> Result<bool> {
        Ok(self.status(xid)? == XidStatus::Aborted)
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock().file.sync_all().context("Failed to sync")
    }

    fn set_status(&self, xid: Xid, status: XidStatus) -> Result<()> {
        if xid.is_super() {
            bail!("The super xid has no status slot");
        }

        let mut inner = self.inner.lock();
        if xid.0 > inner.counter {
            bail!("Xid {} was never allocated", xid.0);
        }
        Self::write_status(&mut inner.file, xid, status)?;
        inner.file.sync_all().context("Failed to sync")?;

        Ok(())
    }

    fn write_status(file: &mut File, xid: Xid, status: XidStatus) -> Result<()> {
        file.seek(SeekFrom::Start(Self::slot(xid)))
            .context("Failed to seek")?;
        file.write_all(&[status.as_byte()])
            .context("Failed to write xid status")?;
        Ok(())
    }

    fn slot(xid: Xid) -> u64 {
        COUNTER_SIZE + (xid.0 - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::SUPER_XID;
    use tempfile::tempdir;

    #[test]
    fn test_super_xid_is_always_committed() -> Result<()> {
        let dir = tempdir()?;
        let tm = XidManager::create(&dir.path().join("test.xid"))?;

        assert_eq!(tm.status(SUPER_XID)?, XidStatus::Committed);
        assert!(!tm.is_active(SUPER_XID)?);
        assert!(tm.commit(SUPER_XID).is_err());

        Ok(())
    }

    #[test]
    fn test_lifecycle() -> Result<()> {
        let dir = tempdir()?;
        let tm = XidManager::create(&dir.path().join("test.xid"))?;

        let x1 = tm.begin()?;
        let x2 = tm.begin()?;
        assert_eq!(x1, Xid(1));
        assert_eq!(x2, Xid(2));
        assert!(tm.is_active(x1)?);

        tm.commit(x1)?;
        tm.abort(x2)?;
        assert!(tm.is_committed(x1)?);
        assert!(tm.is_aborted(x2)?);

        Ok(())
    }

    #[test]
    fn test_status_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.xid");

        {
            let tm = XidManager::create(&path)?;
            let x1 = tm.begin()?;
            let _x2 = tm.begin()?;
            tm.commit(x1)?;
            tm.close()?;
        }

        let tm = XidManager::open(&path)?;
        assert!(tm.is_committed(Xid(1))?);
        assert!(tm.is_active(Xid(2))?);

        let x3 = tm.begin()?;
        assert_eq!(x3, Xid(3));

        Ok(())
    }

    #[test]
    fn test_truncated_file_fails_open() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.xid");

        {
            let tm = XidManager::create(&path)?;
            tm.begin()?;
            tm.begin()?;
        }

        // A counter that promises more slots than the file holds is
        // corruption.
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(COUNTER_SIZE + 1)?;
        drop(file);

        let err = XidManager::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::BadXidFile)
        ));

        Ok(())
    }
}
