use crate::storage::cache::{CacheBacking, ResourceCache};
use crate::storage::disk::DiskManager;
use crate::storage::page::{Page, PageBuf};
use anyhow::Result;
use parking_lot::Mutex;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

struct PageBacking {
    disk: Arc<Mutex<DiskManager>>,
}

impl CacheBacking for PageBacking {
    type Item = Page;

    fn load(&self, key: u64) -> Result<Page> {
        let pgno = key as u32;
        let mut buf: PageBuf = Box::new([0u8; crate::storage::PAGE_SIZE]);
        self.disk.lock().read_page(pgno, &mut buf[..])?;
        Ok(Page::new(pgno, buf))
    }

    fn write_back(&self, key: u64, page: &Page) -> Result<()> {
        if page.is_dirty() {
            let data = page.data();
            self.disk.lock().write_page(key as u32, &data[..])?;
            page.clear_dirty();
        }
        Ok(())
    }
}

/// Fronts the database file with the page cache. Cheap to clone; all
/// clones share one cache and one file.
#[derive(Clone)]
pub struct Pager {
    inner: Arc<PagerInner>,
}

struct PagerInner {
    disk: Arc<Mutex<DiskManager>>,
    cache: ResourceCache<PageBacking>,
}

impl Pager {
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        Ok(Self::with_disk(DiskManager::create(path)?, capacity))
    }

    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        Ok(Self::with_disk(DiskManager::open(path)?, capacity))
    }

    fn with_disk(disk: DiskManager, capacity: usize) -> Self {
        let disk = Arc::new(Mutex::new(disk));
        Self {
            inner: Arc::new(PagerInner {
                disk: disk.clone(),
                cache: ResourceCache::new(PageBacking { disk }, capacity),
            }),
        }
    }

    /// Extends the file by one page holding `init` and returns its number.
    /// The new page is written through; fetch it to pin it.
    pub fn new_page(&self, init: &[u8]) -> Result<u32> {
        let mut disk = self.inner.disk.lock();
        let pgno = disk.allocate_page()?;
        disk.write_page(pgno, init)?;
        Ok(pgno)
    }

    pub fn get_page(&self, pgno: u32) -> Result<PageHandle> {
        let page = self.inner.cache.get(pgno as u64)?;
        Ok(PageHandle {
            pager: self.clone(),
            page,
        })
    }

    pub fn flush_page(&self, page: &Page) -> Result<()> {
        if page.is_dirty() {
            let data = page.data();
            self.inner.disk.lock().write_page(page.pgno(), &data[..])?;
            page.clear_dirty();
        }
        Ok(())
    }

    /// Shrinks the file so that `pgno` is the last page. Only safe while
    /// no page past `pgno` is cached; recovery runs before the cache is
    /// populated.
    pub fn truncate_by_pgno(&self, pgno: u32) -> Result<()> {
        self.inner.disk.lock().truncate(pgno)
    }

    pub fn page_count(&self) -> Result<u32> {
        self.inner.disk.lock().page_count()
    }

    pub fn close(&self) -> Result<()> {
        self.inner.cache.close()
    }
}

/// A pinned page. The pin is dropped with the handle; at the last pin the
/// page is written back if dirty.
pub struct PageHandle {
    pager: Pager,
    page: Arc<Page>,
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if let Err(e) = self.pager.inner.cache.release(self.page.pgno() as u64) {
            tracing::error!(pgno = self.page.pgno(), "page write-back failed: {e:#}");
        }
    }
}
