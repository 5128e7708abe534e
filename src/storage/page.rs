use crate::storage::PAGE_SIZE;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};

pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// An in-cache page: the 8 KiB buffer behind its own lock, plus a dirty
/// flag consulted at write-back.
pub struct Page {
    pgno: u32,
    data: RwLock<PageBuf>,
    dirty: AtomicBool,
}

impl Page {
    pub fn new(pgno: u32, data: PageBuf) -> Self {
        Self {
            pgno,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn pgno(&self) -> u32 {
        self.pgno
    }

    pub fn data(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.data.read()
    }

    /// Locks the buffer for modification and marks the page dirty.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.dirty.store(true, Ordering::SeqCst);
        self.data.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }
}

/// The metadata page (page 1) carries a clean-shutdown witness: 8 random
/// bytes stamped at open, echoed at close. A missing echo on open means the
/// previous run crashed and recovery must replay the log.
pub struct MetaPage<'a> {
    buf: &'a mut [u8; PAGE_SIZE],
}

const VC_OPEN_OFFSET: usize = 100;
const VC_CLOSE_OFFSET: usize = 108;
const VC_LEN: usize = 8;

impl<'a> MetaPage<'a> {
    pub fn from_buf(buf: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { buf }
    }

    /// Fresh metadata page contents with the open witness already stamped.
    pub fn init_buf() -> PageBuf {
        let mut buf: PageBuf = Box::new([0u8; PAGE_SIZE]);
        MetaPage::from_buf(&mut buf).stamp_open();
        buf
    }

    pub fn stamp_open(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.buf[VC_OPEN_OFFSET..VC_OPEN_OFFSET + VC_LEN]);
    }

    pub fn stamp_close(&mut self) {
        self.buf
            .copy_within(VC_OPEN_OFFSET..VC_OPEN_OFFSET + VC_LEN, VC_CLOSE_OFFSET);
    }

    pub fn witness_ok(buf: &[u8; PAGE_SIZE]) -> bool {
        buf[VC_OPEN_OFFSET..VC_OPEN_OFFSET + VC_LEN]
            == buf[VC_CLOSE_OFFSET..VC_CLOSE_OFFSET + VC_LEN]
    }
}

/// An ordinary data page: a little-endian free-space offset in the first
/// two bytes, items packed from byte 2 upward. Space is never reclaimed;
/// the offset only grows.
pub struct DataPage<'a> {
    buf: &'a mut [u8; PAGE_SIZE],
}

const FSO_OFFSET: usize = 0;
pub const DATA_OFFSET: usize = 2;
pub const MAX_FREE_SPACE: usize = PAGE_SIZE - DATA_OFFSET;

impl<'a> DataPage<'a> {
    pub fn from_buf(buf: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { buf }
    }

    /// Fresh data page contents with the free-space offset at the data
    /// start.
    pub fn init_buf() -> PageBuf {
        let mut buf: PageBuf = Box::new([0u8; PAGE_SIZE]);
        buf[FSO_OFFSET..FSO_OFFSET + 2].copy_from_slice(&(DATA_OFFSET as u16).to_le_bytes());
        buf
    }

    pub fn free_space_offset(&self) -> u16 {
        u16::from_le_bytes([self.buf[FSO_OFFSET], self.buf[FSO_OFFSET + 1]])
    }

    fn set_free_space_offset(&mut self, offset: u16) {
        self.buf[FSO_OFFSET..FSO_OFFSET + 2].copy_from_slice(&offset.to_le_bytes());
    }

    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.free_space_offset() as usize
    }

    /// Free space as read from an immutable buffer; used when rebuilding
    /// the free-space index on open.
    pub fn free_space_of(buf: &[u8; PAGE_SIZE]) -> usize {
        PAGE_SIZE - u16::from_le_bytes([buf[FSO_OFFSET], buf[FSO_OFFSET + 1]]) as usize
    }

    /// Appends `raw` at the free-space offset and returns the offset it was
    /// placed at. The caller has already checked that it fits.
    pub fn insert(&mut self, raw: &[u8]) -> u16 {
        let offset = self.free_space_offset();
        let start = offset as usize;
        self.buf[start..start + raw.len()].copy_from_slice(raw);
        self.set_free_space_offset(offset + raw.len() as u16);
        offset
    }

    /// Redo path: re-place `raw` at a known offset and make sure the
    /// free-space offset covers it.
    pub fn recover_insert(&mut self, raw: &[u8], offset: u16) {
        let start = offset as usize;
        self.buf[start..start + raw.len()].copy_from_slice(raw);
        let end = offset + raw.len() as u16;
        if self.free_space_offset() < end {
            self.set_free_space_offset(end);
        }
    }

    /// Redo/undo path: overwrite the item bytes at a known offset without
    /// touching the free-space offset.
    pub fn recover_update(&mut self, raw: &[u8], offset: u16) {
        let start = offset as usize;
        self.buf[start..start + raw.len()].copy_from_slice(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_page_insert_advances_offset() {
        let mut buf = DataPage::init_buf();
        let mut page = DataPage::from_buf(&mut buf);
        assert_eq!(page.free_space_offset() as usize, DATA_OFFSET);
        assert_eq!(page.free_space(), MAX_FREE_SPACE);

        let off1 = page.insert(&[1, 2, 3]);
        let off2 = page.insert(&[4, 5]);
        assert_eq!(off1 as usize, DATA_OFFSET);
        assert_eq!(off2 as usize, DATA_OFFSET + 3);
        assert_eq!(page.free_space(), MAX_FREE_SPACE - 5);
        assert_eq!(&buf[2..7], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_recover_insert_restores_offset() {
        let mut buf = DataPage::init_buf();
        let mut page = DataPage::from_buf(&mut buf);

        page.recover_insert(&[9, 9, 9, 9], 10);
        assert_eq!(page.free_space_offset(), 14);

        // An earlier offset must not move the free-space offset backward.
        page.recover_insert(&[7, 7], 4);
        assert_eq!(page.free_space_offset(), 14);
    }

    #[test]
    fn test_recover_update_leaves_offset_alone() {
        let mut buf = DataPage::init_buf();
        let mut page = DataPage::from_buf(&mut buf);
        page.insert(&[1, 1, 1, 1]);

        page.recover_update(&[8, 8], 2);
        assert_eq!(page.free_space_offset() as usize, DATA_OFFSET + 4);
        assert_eq!(&buf[2..6], &[8, 8, 1, 1]);
    }

    #[test]
    fn test_witness_roundtrip() {
        let mut buf = MetaPage::init_buf();
        assert!(!MetaPage::witness_ok(&buf));

        MetaPage::from_buf(&mut buf).stamp_close();
        assert!(MetaPage::witness_ok(&buf));

        // A new open stamp breaks the witness again.
        MetaPage::from_buf(&mut buf).stamp_open();
        assert!(!MetaPage::witness_ok(&buf));
    }

    #[test]
    fn test_page_dirty_tracking() {
        let page = Page::new(3, Box::new([0u8; PAGE_SIZE]));
        assert!(!page.is_dirty());

        {
            let _read = page.data();
        }
        assert!(!page.is_dirty());

        {
            let mut guard = page.data_mut();
            guard[0] = 1;
        }
        assert!(page.is_dirty());

        page.clear_dirty();
        assert!(!page.is_dirty());
    }
}
