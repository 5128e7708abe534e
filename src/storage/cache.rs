//! Generic reference-counted resource cache.
//!
//! Both the pager (keyed by page number) and the data manager (keyed by
//! item uid) front their resources with this cache. A resource stays
//! resident while at least one handle pins it; at the last release the
//! write-back hook runs and the slot is freed.

use crate::storage::error::StorageError;
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Loader and write-back hooks supplied by the cache owner.
pub trait CacheBacking: Send + Sync {
    type Item: Send + Sync;

    /// Materialize the resource for `key`.
    fn load(&self, key: u64) -> Result<Self::Item>;

    /// Called once the last reference to `key` is released, and for every
    /// resident resource on `close`.
    fn write_back(&self, key: u64, item: &Self::Item) -> Result<()>;
}

struct CacheEntry<T> {
    item: Arc<T>,
    refs: usize,
}

struct CacheState<T> {
    entries: HashMap<u64, CacheEntry<T>>,
    // Keys with a load in flight; concurrent gets wait on `loaded`.
    loading: HashSet<u64>,
    closed: bool,
}

pub struct ResourceCache<B: CacheBacking> {
    backing: B,
    capacity: usize,
    state: Mutex<CacheState<B::Item>>,
    loaded: Condvar,
}

impl<B: CacheBacking> ResourceCache<B> {
    pub fn new(backing: B, capacity: usize) -> Self {
        Self {
            backing,
            capacity,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                loading: HashSet::new(),
                closed: false,
            }),
            loaded: Condvar::new(),
        }
    }

    /// Returns a pinned reference to the resource for `key`, loading it if
    /// absent. Concurrent gets for the same key share a single load.
    pub fn get(&self, key: u64) -> Result<Arc<B::Item>> {
        loop {
            let mut state = self.state.lock();
            if state.closed {
                return Err(StorageError::CacheClosed.into());
            }
            if state.loading.contains(&key) {
                self.loaded.wait(&mut state);
                continue;
            }
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.refs += 1;
                return Ok(entry.item.clone());
            }
            if state.entries.len() + state.loading.len() >= self.capacity {
                return Err(StorageError::CacheFull {
                    capacity: self.capacity,
                }
                .into());
            }
            state.loading.insert(key);
            drop(state);

            let loaded = self.backing.load(key);

            let mut state = self.state.lock();
            state.loading.remove(&key);
            self.loaded.notify_all();
            return match loaded {
                Ok(item) => {
                    let item = Arc::new(item);
                    state.entries.insert(
                        key,
                        CacheEntry {
                            item: item.clone(),
                            refs: 1,
                        },
                    );
                    Ok(item)
                }
                Err(e) => Err(e),
            };
        }
    }

    /// Drops one pin on `key`. At zero pins the resource is written back
    /// and evicted.
    pub fn release(&self, key: u64) -> Result<()> {
        let evicted = {
            let mut state = self.state.lock();
            let entry = match state.entries.get_mut(&key) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            entry.refs -= 1;
            if entry.refs == 0 {
                state.entries.remove(&key)
            } else {
                None
            }
        };

        if let Some(entry) = evicted {
            self.backing.write_back(key, &entry.item)?;
        }

        Ok(())
    }

    /// Writes back every resident resource and refuses further gets.
    pub fn close(&self) -> Result<()> {
        let entries = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.entries)
        };

        for (key, entry) in entries {
            self.backing.write_back(key, &entry.item)?;
        }

        Ok(())
    }

    #[cfg(test)]
    fn resident(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBacking {
        loads: AtomicUsize,
        write_backs: AtomicUsize,
    }

    impl CountingBacking {
        fn new() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                write_backs: AtomicUsize::new(0),
            }
        }
    }

    impl CacheBacking for CountingBacking {
        type Item = u64;

        fn load(&self, key: u64) -> Result<u64> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(key * 10)
        }

        fn write_back(&self, _key: u64, _item: &u64) -> Result<()> {
            self.write_backs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_get_shares_resident_resource() -> Result<()> {
        let cache = ResourceCache::new(CountingBacking::new(), 4);

        let a = cache.get(7)?;
        let b = cache.get(7)?;
        assert_eq!(*a, 70);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.backing.loads.load(Ordering::SeqCst), 1);

        Ok(())
    }

    #[test]
    fn test_release_at_zero_writes_back_and_evicts() -> Result<()> {
        let cache = ResourceCache::new(CountingBacking::new(), 4);

        let _a = cache.get(1)?;
        let _b = cache.get(1)?;
        cache.release(1)?;
        assert_eq!(cache.backing.write_backs.load(Ordering::SeqCst), 0);
        assert_eq!(cache.resident(), 1);

        cache.release(1)?;
        assert_eq!(cache.backing.write_backs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.resident(), 0);

        // A fresh get reloads.
        let _c = cache.get(1)?;
        assert_eq!(cache.backing.loads.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test]
    fn test_full_cache_rejects_new_keys() -> Result<()> {
        let cache = ResourceCache::new(CountingBacking::new(), 2);

        let _a = cache.get(1)?;
        let _b = cache.get(2)?;

        let err = cache.get(3).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::CacheFull { capacity: 2 })
        ));

        // Pinned keys are still reachable.
        let _again = cache.get(1)?;

        cache.release(2)?;
        cache.release(2)?;
        let _c = cache.get(3)?;

        Ok(())
    }

    #[test]
    fn test_close_writes_back_everything() -> Result<()> {
        let cache = ResourceCache::new(CountingBacking::new(), 4);

        let _a = cache.get(1)?;
        let _b = cache.get(2)?;
        cache.close()?;

        assert_eq!(cache.backing.write_backs.load(Ordering::SeqCst), 2);
        assert!(matches!(
            cache.get(5).unwrap_err().downcast_ref::<StorageError>(),
            Some(StorageError::CacheClosed)
        ));

        Ok(())
    }

    #[test]
    fn test_concurrent_gets_load_once() -> Result<()> {
        let cache = Arc::new(ResourceCache::new(CountingBacking::new(), 8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || cache.get(3).map(|v| *v)));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap()?, 30);
        }
        assert_eq!(cache.backing.loads.load(Ordering::SeqCst), 1);

        Ok(())
    }
}
