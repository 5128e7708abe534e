use crate::storage::PAGE_SIZE;
use parking_lot::Mutex;

/// Number of free-space size classes.
pub const INTERVALS: usize = 40;
/// Width of one class in bytes.
pub const THRESHOLD: usize = PAGE_SIZE / INTERVALS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub pgno: u32,
    pub free: usize,
}

/// Free-space index over data pages. A page sits in the class of its free
/// space; `select` takes it out, and the caller re-files it after the
/// insert with its new free space.
pub struct PageIndex {
    lists: Mutex<Vec<Vec<PageInfo>>>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(vec![Vec::new(); INTERVALS + 1]),
        }
    }

    pub fn add(&self, pgno: u32, free: usize) {
        let class = free / THRESHOLD;
        self.lists.lock()[class].push(PageInfo { pgno, free });
    }

    /// Picks a page with at least `size` free bytes, removing it from the
    /// index. Rounds the class up so every page in a scanned class
    /// qualifies by construction.
    pub fn select(&self, size: usize) -> Option<PageInfo> {
        let mut class = size / THRESHOLD;
        if class < INTERVALS {
            class += 1;
        }
        let mut lists = self.lists.lock();
        for list in lists[class..].iter_mut() {
            if let Some(info) = list.pop() {
                return Some(info);
            }
        }
        None
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::new()
    }
}
