//! Data items: the variable-length cells a page holds.
//!
//! An item's on-page layout is `[valid:1][size:2][data]`, addressed by a
//! 64-bit uid packing the page number and the in-page offset. Mutation
//! follows a before/after protocol: the write guard snapshots the old
//! image, the caller edits a staged copy, and committing logs an update
//! record before the bytes reach the page. Dropping the guard uncommitted
//! discards the staged edit.

use crate::recovery::log_record::LogRecord;
use crate::storage::{PageHandle, Wal};
use crate::transaction::Xid;
use anyhow::Result;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::Deref;
use std::sync::Arc;

const VALID_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 1;
pub const ITEM_HEADER_SIZE: usize = 3;

pub fn pack_uid(pgno: u32, offset: u16) -> u64 {
    ((pgno as u64) << 32) | offset as u64
}

pub fn unpack_uid(uid: u64) -> (u32, u16) {
    ((uid >> 32) as u32, uid as u16)
}

/// Wraps payload bytes into an item image: `[valid=1][size][data]`.
pub fn wrap_raw(data: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(ITEM_HEADER_SIZE + data.len());
    raw.push(1);
    raw.extend_from_slice(&(data.len() as u16).to_le_bytes());
    raw.extend_from_slice(data);
    raw
}

/// A data item pinned on its page. Shared through the data manager's item
/// cache; the latch serializes readers and the single writer.
pub struct DataItem {
    uid: u64,
    offset: usize,
    len: usize,
    page: PageHandle,
    wal: Arc<Wal>,
    latch: RwLock<()>,
}

impl DataItem {
    pub(crate) fn parse(page: PageHandle, offset: u16, uid: u64, wal: Arc<Wal>) -> Self {
        let offset = offset as usize;
        let len = {
            let buf = page.data();
            u16::from_le_bytes([buf[offset + SIZE_OFFSET], buf[offset + SIZE_OFFSET + 1]]) as usize
        };
        Self {
            uid,
            offset,
            len,
            page,
            wal,
            latch: RwLock::new(()),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn valid(&self) -> bool {
        self.page.data()[self.offset + VALID_OFFSET] == 1
    }

    /// Shared access to the item's data bytes.
    pub fn read(&self) -> ItemReadGuard<'_> {
        let latch = self.latch.read();
        let data = {
            let buf = self.page.data();
            let start = self.offset + ITEM_HEADER_SIZE;
            buf[start..start + self.len].to_vec()
        };
        ItemReadGuard {
            _latch: latch,
            data,
        }
    }

    /// Exclusive access for mutation. The pre-image is snapshotted here;
    /// nothing touches the page until `commit`.
    pub fn write(&self) -> ItemWriteGuard<'_> {
        let latch = self.latch.write();
        let (old_raw, data) = {
            let buf = self.page.data();
            let raw_len = ITEM_HEADER_SIZE + self.len;
            let old_raw = buf[self.offset..self.offset + raw_len].to_vec();
            let data = old_raw[ITEM_HEADER_SIZE..].to_vec();
            (old_raw, data)
        };
        ItemWriteGuard {
            item: self,
            _latch: latch,
            old_raw,
            data,
        }
    }
}

pub struct ItemReadGuard<'a> {
    _latch: RwLockReadGuard<'a, ()>,
    data: Vec<u8>,
}

impl Deref for ItemReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

pub struct ItemWriteGuard<'a> {
    item: &'a DataItem,
    _latch: RwLockWriteGuard<'a, ()>,
    old_raw: Vec<u8>,
    data: Vec<u8>,
}

impl ItemWriteGuard<'_> {
    /// The staged data bytes. The item's size is fixed; edits happen in
    /// place.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Logs the mutation under `xid`, then applies the staged bytes to the
    /// page. The log write precedes the page write, so a mutation visible
    /// on a page always has its record on disk.
    pub fn commit(self, xid: Xid) -> Result<()> {
        let new_raw = wrap_raw(&self.data);
        let record = LogRecord::Update {
            xid,
            uid: self.item.uid,
            old_raw: self.old_raw,
            new_raw: new_raw.clone(),
        };
        self.item.wal.log(&record.encode())?;

        let mut buf = self.item.page.data_mut();
        buf[self.item.offset..self.item.offset + new_raw.len()].copy_from_slice(&new_raw);

        Ok(())
    }
}
