//! The data manager: the public storage API.
//!
//! Hands out stable 64-bit item uids, reads items through a
//! reference-counted cache, and emits a WAL record for every mutation
//! before it reaches a page. On open it checks the clean-shutdown witness
//! on page 1 and replays the log when the witness is broken.

use crate::data::item::{pack_uid, unpack_uid, wrap_raw, DataItem, ITEM_HEADER_SIZE};
use crate::data::page_index::PageIndex;
use crate::recovery;
use crate::recovery::log_record::LogRecord;
use crate::storage::cache::{CacheBacking, ResourceCache};
use crate::storage::error::StorageError;
use crate::storage::page::{DataPage, MetaPage, MAX_FREE_SPACE};
use crate::storage::{PageHandle, Pager, Wal};
use crate::transaction::{Xid, XidManager};
use anyhow::{ensure, Context, Result};
use parking_lot::Mutex;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct ItemBacking {
    pager: Pager,
    wal: Arc<Wal>,
}

impl CacheBacking for ItemBacking {
    type Item = DataItem;

    fn load(&self, uid: u64) -> Result<DataItem> {
        let (pgno, offset) = unpack_uid(uid);
        let page = self.pager.get_page(pgno)?;
        Ok(DataItem::parse(page, offset, uid, self.wal.clone()))
    }

    fn write_back(&self, _uid: u64, _item: &DataItem) -> Result<()> {
        // The item's page pin is released when the item drops; the page
        // cache does the actual write-back.
        Ok(())
    }
}

/// Cheap to clone; all clones share one engine instance.
#[derive(Clone)]
pub struct DataManager {
    inner: Arc<DmInner>,
}

struct DmInner {
    pager: Pager,
    wal: Arc<Wal>,
    tm: Arc<XidManager>,
    page_index: PageIndex,
    items: ResourceCache<ItemBacking>,
    page_one: Mutex<Option<PageHandle>>,
}

impl DataManager {
    /// Creates a fresh database: `<path>.db` with the metadata page and an
    /// empty `<path>.log`.
    pub fn create(path: &Path, cache_pages: usize, tm: Arc<XidManager>) -> Result<Self> {
        let pager = Pager::create(&suffixed(path, ".db"), cache_pages)?;
        let wal = Arc::new(Wal::create(&suffixed(path, ".log"))?);

        let pgno = pager.new_page(&MetaPage::init_buf()[..])?;
        ensure!(pgno == 1, "Metadata page must be page 1, got {}", pgno);

        let dm = Self::assemble(pager, wal, tm);
        dm.pin_page_one()?;
        Ok(dm)
    }

    /// Opens an existing database, running crash recovery when the
    /// clean-shutdown witness is broken.
    pub fn open(path: &Path, cache_pages: usize, tm: Arc<XidManager>) -> Result<Self> {
        let pager = Pager::open(&suffixed(path, ".db"), cache_pages)?;
        let wal = Arc::new(Wal::open(&suffixed(path, ".log"))?);

        let clean = {
            let page_one = pager.get_page(1).context("Failed to read metadata page")?;
            let ok = MetaPage::witness_ok(&page_one.data());
            ok
        };
        if !clean {
            tracing::warn!("unclean shutdown detected, replaying log");
            recovery::recover(&tm, &wal, &pager)?;
        }

        let dm = Self::assemble(pager, wal, tm);
        dm.fill_page_index()?;
        dm.pin_page_one()?;

        // Stamp a fresh open witness so the next open knows whether this
        // run shut down cleanly.
        {
            let page_one = dm.inner.page_one.lock();
            let page_one = page_one.as_ref().unwrap();
            {
                let mut buf = page_one.data_mut();
                MetaPage::from_buf(&mut buf).stamp_open();
            }
            dm.inner.pager.flush_page(page_one)?;
        }

        Ok(dm)
    }

    fn assemble(pager: Pager, wal: Arc<Wal>, tm: Arc<XidManager>) -> Self {
        let items = ResourceCache::new(
            ItemBacking {
                pager: pager.clone(),
                wal: wal.clone(),
            },
            // Items are not the bounded resource; the pages they pin are.
            usize::MAX,
        );
        Self {
            inner: Arc::new(DmInner {
                pager,
                wal,
                tm,
                page_index: PageIndex::new(),
                items,
                page_one: Mutex::new(None),
            }),
        }
    }

    fn pin_page_one(&self) -> Result<()> {
        let page_one = self.inner.pager.get_page(1)?;
        *self.inner.page_one.lock() = Some(page_one);
        Ok(())
    }

    fn fill_page_index(&self) -> Result<()> {
        for pgno in 2..=self.inner.pager.page_count()? {
            let page = self.inner.pager.get_page(pgno)?;
            let free = DataPage::free_space_of(&page.data());
            self.inner.page_index.add(pgno, free);
        }
        Ok(())
    }

    /// Fetches the item at `uid`, or None if it has been invalidated.
    pub fn read(&self, uid: u64) -> Result<Option<DataItemHandle>> {
        let item = self.inner.items.get(uid)?;
        let handle = DataItemHandle {
            dm: self.clone(),
            item,
        };
        if !handle.valid() {
            return Ok(None);
        }
        Ok(Some(handle))
    }

    /// Stores `data` as a new item under `xid` and returns its uid. The
    /// insert record hits the log before the page is touched.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<u64> {
        let raw = wrap_raw(data);
        if raw.len() > MAX_FREE_SPACE {
            return Err(StorageError::DataTooLarge {
                size: data.len(),
                max: MAX_FREE_SPACE - ITEM_HEADER_SIZE,
            }
            .into());
        }

        for _ in 0..5 {
            let info = match self.inner.page_index.select(raw.len()) {
                Some(info) => info,
                None => {
                    // Extend the file and retry.
                    let pgno = self.inner.pager.new_page(&DataPage::init_buf()[..])?;
                    self.inner.page_index.add(pgno, MAX_FREE_SPACE);
                    continue;
                }
            };

            let page = self.inner.pager.get_page(info.pgno)?;
            let (offset, free) = {
                let mut buf = page.data_mut();
                let mut data_page = DataPage::from_buf(&mut buf);
                if data_page.free_space() < raw.len() {
                    // The index class was optimistic; re-file and rescan.
                    let free = data_page.free_space();
                    drop(buf);
                    self.inner.page_index.add(info.pgno, free);
                    continue;
                }

                let offset = data_page.free_space_offset();
                let record = LogRecord::Insert {
                    xid,
                    pgno: info.pgno,
                    offset,
                    raw: raw.clone(),
                };
                self.inner.wal.log(&record.encode())?;

                data_page.insert(&raw);
                (offset, data_page.free_space())
            };
            self.inner.page_index.add(info.pgno, free);

            return Ok(pack_uid(info.pgno, offset));
        }

        Err(StorageError::NoSpaceOnAnyPage { size: raw.len() }.into())
    }

    /// Flushes everything and stamps the clean-shutdown witness. All item
    /// handles must have been dropped.
    pub fn close(&self) -> Result<()> {
        self.inner.items.close()?;

        if let Some(page_one) = self.inner.page_one.lock().take() {
            {
                let mut buf = page_one.data_mut();
                MetaPage::from_buf(&mut buf).stamp_close();
            }
            self.inner.pager.flush_page(&page_one)?;
        }

        self.inner.pager.close()?;
        self.inner.tm.close()?;
        Ok(())
    }

    fn release_item(&self, uid: u64) -> Result<()> {
        self.inner.items.release(uid)
    }
}

/// A pinned data item. The pin (and through it, the page pin) is dropped
/// with the handle.
pub struct DataItemHandle {
    dm: DataManager,
    item: Arc<DataItem>,
}

impl Deref for DataItemHandle {
    type Target = DataItem;

    fn deref(&self) -> &DataItem {
        &self.item
    }
}

impl Drop for DataItemHandle {
    fn drop(&mut self) {
        if let Err(e) = self.dm.release_item(self.item.uid()) {
            tracing::error!(uid = self.item.uid(), "item release failed: {e:#}");
        }
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
