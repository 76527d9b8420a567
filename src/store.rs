//! Fetching and latching allocation pages.
//!
//! A latch is a `parking_lot` guard that owns a reference to the page's lock, so it can be held
//! independently of the store. Dropping the guard releases the latch.

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, RawRwLock, RwLock,
};

use crate::{
    alloc_page::AllocPage,
    error::{Result, SpaceError},
};

/// Shared latch on an allocation page.
pub type SharedLatch = ArcRwLockReadGuard<RawRwLock, AllocPage>;

/// Exclusive latch on an allocation page.
pub type ExclusiveLatch = ArcRwLockWriteGuard<RawRwLock, AllocPage>;

/// Access to a container's allocation pages through the page cache.
pub trait AllocPageStore {
    /// Fetch a page and latch it for reading, waiting for any exclusive holder.
    fn latch_shared(&self, page_number: u64) -> Result<SharedLatch>;

    /// Fetch a page and latch it for modification, waiting for any other holder.
    fn latch_exclusive(&self, page_number: u64) -> Result<ExclusiveLatch>;

    /// Fetch a page and latch it for modification, or return `None` if that would have to wait.
    fn try_latch_exclusive(&self, page_number: u64) -> Result<Option<ExclusiveLatch>>;

    /// Add a newly formatted allocation page, returning it exclusively latched. Fails if the page
    /// number is already taken.
    fn create_alloc_page(&self, page: AllocPage) -> Result<ExclusiveLatch>;

    /// Drop an allocation page that is no longer part of the chain. No-op if it isn't there.
    fn remove_alloc_page(&self, page_number: u64) -> Result<()>;
}

/// Physically reserves pages on disk ahead of use.
pub trait PagePreallocator {
    /// Reserve up to `count` pages after `last_page`. Returns how many were reserved, which may be
    /// fewer than asked for.
    fn preallocate_pages(&self, last_page: u64, count: u32) -> Result<u32>;
}

macro_rules! forward_store {
    ($($ty:ty),*) => {$(
        impl<T: AllocPageStore + ?Sized> AllocPageStore for $ty {
            fn latch_shared(&self, page_number: u64) -> Result<SharedLatch> {
                (**self).latch_shared(page_number)
            }
            fn latch_exclusive(&self, page_number: u64) -> Result<ExclusiveLatch> {
                (**self).latch_exclusive(page_number)
            }
            fn try_latch_exclusive(&self, page_number: u64) -> Result<Option<ExclusiveLatch>> {
                (**self).try_latch_exclusive(page_number)
            }
            fn create_alloc_page(&self, page: AllocPage) -> Result<ExclusiveLatch> {
                (**self).create_alloc_page(page)
            }
            fn remove_alloc_page(&self, page_number: u64) -> Result<()> {
                (**self).remove_alloc_page(page_number)
            }
        }

        impl<T: PagePreallocator + ?Sized> PagePreallocator for $ty {
            fn preallocate_pages(&self, last_page: u64, count: u32) -> Result<u32> {
                (**self).preallocate_pages(last_page, count)
            }
        }
    )*};
}

forward_store!(&T, Arc<T>);

/// In-memory allocation page store.
///
/// Counts how many times each page has been fetched, so callers can see how much chain walking an
/// operation needed.
#[derive(Default)]
pub struct MemPageStore {
    pages: RwLock<HashMap<u64, Arc<RwLock<AllocPage>>>>,
    fetches: Mutex<HashMap<u64, usize>>,
    last_reserved: AtomicU64,
    fail_preallocation: AtomicBool,
}

impl MemPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn fetch(&self, page_number: u64) -> Result<Arc<RwLock<AllocPage>>> {
        let page = self
            .pages
            .read()
            .get(&page_number)
            .cloned()
            .ok_or(SpaceError::NotFound { page: page_number })?;
        *self.fetches.lock().entry(page_number).or_default() += 1;
        Ok(page)
    }

    /// Times the page has been fetched since the last [`reset_fetches`](Self::reset_fetches).
    pub fn fetch_count(&self, page_number: u64) -> usize {
        self.fetches.lock().get(&page_number).copied().unwrap_or(0)
    }

    /// Total fetches of all pages.
    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }

    pub fn reset_fetches(&self) {
        self.fetches.lock().clear();
    }

    /// Page numbers of every stored allocation page, in order.
    pub fn page_numbers(&self) -> Vec<u64> {
        let mut pages: Vec<u64> = self.pages.read().keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Highest page number reserved through [`PagePreallocator`].
    pub fn last_reserved_page(&self) -> u64 {
        self.last_reserved.load(Ordering::Acquire)
    }

    /// Make every following preallocation request fail, as a full disk would.
    pub fn fail_preallocation(&self, fail: bool) {
        self.fail_preallocation.store(fail, Ordering::Release);
    }
}

impl AllocPageStore for MemPageStore {
    fn latch_shared(&self, page_number: u64) -> Result<SharedLatch> {
        Ok(self.fetch(page_number)?.read_arc())
    }

    fn latch_exclusive(&self, page_number: u64) -> Result<ExclusiveLatch> {
        Ok(self.fetch(page_number)?.write_arc())
    }

    fn try_latch_exclusive(&self, page_number: u64) -> Result<Option<ExclusiveLatch>> {
        Ok(self.fetch(page_number)?.try_write_arc())
    }

    fn create_alloc_page(&self, page: AllocPage) -> Result<ExclusiveLatch> {
        let page_number = page.page_number();
        let mut pages = self.pages.write();
        if pages.contains_key(&page_number) {
            return Err(SpaceError::PageExists { page: page_number });
        }
        let page = Arc::new(RwLock::new(page));
        let latch = page.write_arc();
        pages.insert(page_number, page);
        Ok(latch)
    }

    fn remove_alloc_page(&self, page_number: u64) -> Result<()> {
        self.pages.write().remove(&page_number);
        Ok(())
    }
}

impl PagePreallocator for MemPageStore {
    fn preallocate_pages(&self, last_page: u64, count: u32) -> Result<u32> {
        if self.fail_preallocation.load(Ordering::Acquire) {
            return Err(SpaceError::Io(io::Error::new(io::ErrorKind::Other, "no space left on device")));
        }
        self.last_reserved
            .fetch_max(last_page + u64::from(count), Ordering::AcqRel);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::SpaceOptions, page::PageKey};

    #[test]
    fn latches_and_fetch_counts() {
        let store = MemPageStore::new();
        let page = AllocPage::create(PageKey::new(1, 0), &SpaceOptions::default(), 0).unwrap();
        let latch = store.create_alloc_page(page).unwrap();
        assert!(store.try_latch_exclusive(0).unwrap().is_none());
        drop(latch);

        {
            let a = store.latch_shared(0).unwrap();
            let b = store.latch_shared(0).unwrap();
            assert_eq!(a.page_number(), b.page_number());
            assert!(store.try_latch_exclusive(0).unwrap().is_none());
        }
        assert!(store.try_latch_exclusive(0).unwrap().is_some());
        assert_eq!(store.fetch_count(0), 5);
        store.reset_fetches();
        assert_eq!(store.total_fetches(), 0);

        assert!(matches!(store.latch_shared(7), Err(SpaceError::NotFound { page: 7 })));
        assert_eq!(store.page_numbers(), vec![0]);
    }

    #[test]
    fn alloc_page_numbers_are_not_reused_while_taken() {
        let store = MemPageStore::new();
        let page = |n| AllocPage::create(PageKey::new(1, n), &SpaceOptions::default(), 0).unwrap();
        drop(store.create_alloc_page(page(11)).unwrap());
        store.latch_exclusive(11).unwrap().allocate_page(crate::LogInstant::new(1), 12).unwrap();

        assert!(matches!(store.create_alloc_page(page(11)), Err(SpaceError::PageExists { page: 11 })));
        assert_eq!(store.latch_shared(11).unwrap().extent().allocated_count(), 1);

        store.remove_alloc_page(11).unwrap();
        store.remove_alloc_page(11).unwrap();
        assert!(store.page_numbers().is_empty());
        drop(store.create_alloc_page(page(11)).unwrap());
        assert_eq!(store.latch_shared(11).unwrap().extent().allocated_count(), 0);
    }

    #[test]
    fn preallocation() {
        let store = MemPageStore::new();
        assert_eq!(store.preallocate_pages(10, 4).unwrap(), 4);
        assert_eq!(store.last_reserved_page(), 14);
        store.fail_preallocation(true);
        assert!(store.preallocate_pages(14, 4).is_err());
        assert_eq!(store.last_reserved_page(), 14);
    }
}
