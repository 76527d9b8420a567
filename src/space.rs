//! Container-side allocation: reuse or grow, chaining allocation pages as the container fills.

use parking_lot::Mutex;

use crate::{
    alloc_page::AllocPage,
    cache::{AllocationCache, SpaceInfo},
    config::SpaceOptions,
    error::{Result, SpaceError},
    extent::PageStatus,
    log::AllocationLog,
    page::PageKey,
    store::{AllocPageStore, PagePreallocator},
    FIRST_ALLOC_PAGE_NUMBER,
};

struct SpaceState<L> {
    cache: AllocationCache,
    log: L,
    /// Most recently allocated page. Allocation continues after it before reusing earlier pages.
    last_allocated: Option<u64>,
}

/// Page allocation for one container.
///
/// All allocation metadata access goes through one lock, which also serializes use of the
/// allocation cache. Allocation pages are latched under that lock and released before it is.
pub struct ContainerSpace<S, P, L> {
    container: u64,
    options: SpaceOptions,
    container_info: Vec<u8>,
    store: S,
    preallocator: P,
    state: Mutex<SpaceState<L>>,
}

impl<S, P, L> ContainerSpace<S, P, L>
where
    S: AllocPageStore,
    P: PagePreallocator,
    L: AllocationLog,
{
    /// Set up allocation for a new, empty container. `container_info` is kept in the borrowed space
    /// of the first allocation page.
    pub fn create(
        store: S,
        preallocator: P,
        log: L,
        options: SpaceOptions,
        container: u64,
        container_info: &[u8],
    ) -> Result<Self> {
        let key = PageKey::new(container, FIRST_ALLOC_PAGE_NUMBER);
        let first = AllocPage::create(key, &options, container_info.len())?;
        drop(store.create_alloc_page(first)?);
        tracing::debug!(container, page_size = options.page_size, "created container space");
        Ok(Self::new(store, preallocator, log, options, container, container_info.to_vec()))
    }

    /// Pick up allocation for an existing container whose allocation pages are in `store`.
    ///
    /// The whole allocation page chain is walked once, so a broken chain is caught here.
    pub fn open(
        store: S,
        preallocator: P,
        log: L,
        options: SpaceOptions,
        container: u64,
        container_info: Vec<u8>,
    ) -> Result<Self> {
        options.validate()?;
        {
            let first = store.latch_shared(FIRST_ALLOC_PAGE_NUMBER)?;
            let old = first.borrowed_space_len();
            if old != container_info.len() {
                return Err(SpaceError::ContainerInfoChanged {
                    old,
                    new: container_info.len(),
                });
            }
        }
        let space = Self::new(store, preallocator, log, options, container, container_info);
        {
            let mut state = space.state.lock();
            state.cache.validate(&space.store, FIRST_ALLOC_PAGE_NUMBER)?;
            tracing::debug!(container, alloc_pages = state.cache.len(), "opened container space");
        }
        Ok(space)
    }

    fn new(store: S, preallocator: P, log: L, options: SpaceOptions, container: u64, container_info: Vec<u8>) -> Self {
        Self {
            container,
            state: Mutex::new(SpaceState {
                cache: AllocationCache::new(&options),
                log,
                last_allocated: None,
            }),
            options,
            container_info,
            store,
            preallocator,
        }
    }

    pub fn container(&self) -> u64 {
        self.container
    }

    pub fn options(&self) -> &SpaceOptions {
        &self.options
    }

    pub fn container_info(&self) -> &[u8] {
        &self.container_info
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `f` with read access to the allocation log, under the allocation lock.
    pub fn with_log<T>(&self, f: impl FnOnce(&L) -> T) -> T {
        f(&self.state.lock().log)
    }

    /// Undo every allocation change still in the log, then forget everything cached about the
    /// chain.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        let SpaceState {
            cache,
            log,
            last_allocated,
        } = &mut *state;
        let result = log.rollback(&self.store);
        cache.reset();
        *last_allocated = None;
        tracing::debug!(container = self.container, ok = result.is_ok(), "rolled back allocation changes");
        result
    }

    /// Allocate a page, reusing a free one if possible and growing the container otherwise.
    pub fn add_page(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let SpaceState {
            cache,
            log,
            last_allocated,
        } = &mut *state;

        let mut number = FIRST_ALLOC_PAGE_NUMBER;
        loop {
            let mut alloc_page = self.store.latch_exclusive(number)?;
            if alloc_page.can_add_free_page(*last_allocated) {
                let page = alloc_page.next_free_page_number(*last_allocated);
                if page <= alloc_page.max_page_number() {
                    let grew = alloc_page.last_page_number().map_or(true, |last| page > last);
                    alloc_page.log_allocate(log, page)?;
                    cache.invalidate_one(Some(&mut *alloc_page), number);
                    if grew && alloc_page.is_last() {
                        cache.invalidate_last();
                    }
                    // Reserve more once the pages reserved so far are used up.
                    if grew && page >= alloc_page.last_preallocated_page_number() {
                        alloc_page.preallocate(
                            &self.preallocator,
                            self.options.preallocate_threshold,
                            self.options.preallocate_batch,
                        );
                    }
                    *last_allocated = Some(page);
                    return Ok(page);
                }
            }

            match alloc_page.next_alloc_page_number() {
                Some(next) => number = next,
                None => {
                    let next = alloc_page.max_page_number() + 1;
                    let offset = next * self.options.page_size as u64;
                    let fresh = AllocPage::create(PageKey::new(self.container, next), &self.options, 0)?;
                    drop(self.store.create_alloc_page(fresh)?);
                    alloc_page.log_chain(log, next, offset)?;
                    cache.invalidate_one(Some(&mut *alloc_page), number);
                    cache.invalidate_last();
                    tracing::debug!(
                        container = self.container,
                        alloc_page = next,
                        prev = number,
                        "chained new allocation page"
                    );
                    number = next;
                }
            }
        }
    }

    /// Free an allocated page for reuse.
    ///
    /// # Panics
    ///
    /// Panics if the page is already free.
    pub fn remove_page(&self, page: u64) -> Result<()> {
        let mut state = self.state.lock();
        let SpaceState {
            cache,
            log,
            last_allocated,
        } = &mut *state;

        let number = cache
            .get_allocation_page_number(&self.store, page, FIRST_ALLOC_PAGE_NUMBER)?
            .ok_or(SpaceError::PageOutOfRange { page })?;
        let mut alloc_page = self.store.latch_exclusive(number)?;
        alloc_page.log_deallocate(log, page)?;
        cache.invalidate_one(Some(&mut *alloc_page), number);
        // Reuse the freed page before growing further.
        if last_allocated.map_or(false, |last| page <= last) {
            *last_allocated = None;
        }
        Ok(())
    }

    /// Record whether an allocated page has room for more rows. Best effort: the mark is kept in the
    /// cache until the page's allocation page is next changed or written.
    pub fn track_unfilled(&self, page: u64, is_unfilled: bool) {
        self.state.lock().cache.track_unfilled(page, is_unfilled)
    }

    /// An allocated page marked unfilled, other than `excluding` if possible.
    pub fn unfilled_page(&self, excluding: Option<u64>) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        state
            .cache
            .get_unfilled_page_number(&self.store, excluding, FIRST_ALLOC_PAGE_NUMBER)
    }

    pub fn page_status(&self, page: u64) -> Result<Option<PageStatus>> {
        let mut state = self.state.lock();
        state.cache.get_page_status(&self.store, page, FIRST_ALLOC_PAGE_NUMBER)
    }

    /// The allocation page that manages `page`.
    pub fn allocation_page_for(&self, page: u64) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        state
            .cache
            .get_allocation_page_number(&self.store, page, FIRST_ALLOC_PAGE_NUMBER)
    }

    pub fn last_page_number(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        state.cache.get_last_page_number(&self.store, FIRST_ALLOC_PAGE_NUMBER)
    }

    pub fn last_valid_page(&self) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        state.cache.get_last_valid_page(&self.store, FIRST_ALLOC_PAGE_NUMBER)
    }

    pub fn next_valid_page(&self, after: Option<u64>) -> Result<Option<u64>> {
        let mut state = self.state.lock();
        state
            .cache
            .get_next_valid_page(&self.store, after, FIRST_ALLOC_PAGE_NUMBER)
    }

    pub fn estimated_page_count(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state
            .cache
            .get_estimated_page_count(&self.store, FIRST_ALLOC_PAGE_NUMBER)
    }

    pub fn space_info(&self) -> Result<SpaceInfo> {
        let mut state = self.state.lock();
        state.cache.get_all_page_counts(&self.store, FIRST_ALLOC_PAGE_NUMBER)
    }

    /// Allocation page numbers in chain order.
    pub fn alloc_pages(&self) -> Result<Vec<u64>> {
        let mut pages = Vec::new();
        let mut next = Some(FIRST_ALLOC_PAGE_NUMBER);
        while let Some(number) = next {
            pages.push(number);
            next = self.store.latch_shared(number)?.next_alloc_page_number();
        }
        Ok(pages)
    }

    /// Hand every unfilled mark held in the cache back to its allocation page.
    pub fn sync_unfilled(&self) -> Result<()> {
        let mut state = self.state.lock();
        for number in state.cache.dirty_alloc_pages() {
            let mut alloc_page = self.store.latch_exclusive(number)?;
            state.cache.invalidate_one(Some(&mut *alloc_page), number);
        }
        Ok(())
    }

    /// Write the on-disk image of an allocation page, container info included.
    pub fn write_alloc_page(&self, number: u64, image: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        let mut alloc_page = self.store.latch_exclusive(number)?;
        state.cache.invalidate_one(Some(&mut *alloc_page), number);
        alloc_page.write(image)?;
        if number == FIRST_ALLOC_PAGE_NUMBER {
            AllocPage::write_container_info(&self.container_info, image, false)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        log::MemoryLog,
        store::MemPageStore,
    };

    type MemSpace<'a> = ContainerSpace<&'a MemPageStore, &'a MemPageStore, MemoryLog>;

    fn space(store: &MemPageStore, capacity: u32) -> MemSpace<'_> {
        let mut opts = SpaceOptions::default();
        opts.strict(true).extent_capacity_limit(capacity).preallocate(4, 4);
        ContainerSpace::create(store, store, MemoryLog::new(), opts, 2, b"hdr").unwrap()
    }

    #[test]
    fn grows_then_chains() {
        let store = MemPageStore::new();
        let space = space(&store, 10);
        for expected in 1..=10 {
            assert_eq!(space.add_page().unwrap(), expected);
        }
        // Page 11 becomes the next allocation page
        assert_eq!(space.add_page().unwrap(), 12);
        assert_eq!(space.alloc_pages().unwrap(), vec![0, 11]);
        assert_eq!(space.allocation_page_for(12).unwrap(), Some(11));
        assert_eq!(space.allocation_page_for(5).unwrap(), Some(0));
        assert_eq!(space.allocation_page_for(11).unwrap(), None);
        assert_eq!(space.last_page_number().unwrap(), Some(12));
        assert_eq!(space.estimated_page_count().unwrap(), 11);
        assert_eq!(space.page_status(12).unwrap(), Some(PageStatus::Allocated));
        assert_eq!(space.page_status(13).unwrap(), None);
    }

    #[test]
    fn freed_pages_are_reused() {
        let store = MemPageStore::new();
        let space = space(&store, 10);
        for _ in 0..14 {
            space.add_page().unwrap();
        }
        space.remove_page(3).unwrap();
        space.remove_page(13).unwrap();
        assert_eq!(space.page_status(3).unwrap(), Some(PageStatus::Free));
        assert_eq!(
            space.space_info().unwrap(),
            SpaceInfo {
                allocated: 12,
                free: 2,
                unfilled: 0
            }
        );
        assert_eq!(space.add_page().unwrap(), 3);
        assert_eq!(space.add_page().unwrap(), 13);
        assert_eq!(space.add_page().unwrap(), 16);
        assert!(matches!(space.remove_page(11), Err(SpaceError::PageOutOfRange { page: 11 })));
    }

    #[test]
    fn valid_page_walks() {
        let store = MemPageStore::new();
        let space = space(&store, 10);
        for _ in 0..15 {
            space.add_page().unwrap();
        }
        space.remove_page(1).unwrap();
        space.remove_page(10).unwrap();
        space.remove_page(16).unwrap();
        assert_eq!(space.next_valid_page(None).unwrap(), Some(2));
        assert_eq!(space.next_valid_page(Some(9)).unwrap(), Some(12));
        assert_eq!(space.last_valid_page().unwrap(), Some(15));
        assert_eq!(space.last_page_number().unwrap(), Some(16));
    }

    #[test]
    fn unfilled_tracking() {
        let store = MemPageStore::new();
        let space = space(&store, 10);
        for _ in 0..6 {
            space.add_page().unwrap();
        }
        // Marks are only kept by a warm cache
        space.track_unfilled(2, true);
        assert_eq!(space.unfilled_page(None).unwrap(), None);
        space.estimated_page_count().unwrap();
        space.track_unfilled(2, true);
        space.track_unfilled(5, true);
        assert_eq!(space.unfilled_page(None).unwrap(), Some(2));
        assert_eq!(space.unfilled_page(Some(2)).unwrap(), Some(5));

        // Marks survive an allocation on the same page
        space.add_page().unwrap();
        assert_eq!(space.unfilled_page(None).unwrap(), Some(2));
        space.remove_page(2).unwrap();
        assert_eq!(space.unfilled_page(None).unwrap(), Some(5));
        assert_eq!(space.space_info().unwrap().unfilled, 1);

        space.sync_unfilled().unwrap();
        let alloc_page = store.latch_shared(0).unwrap();
        assert_eq!(alloc_page.extent().find_unfilled_page(None), Some(5));
    }

    #[test]
    fn preallocates_past_threshold() {
        let store = MemPageStore::new();
        let space = space(&store, 20);
        for _ in 0..3 {
            space.add_page().unwrap();
        }
        assert_eq!(store.last_reserved_page(), 0);
        space.add_page().unwrap();
        assert_eq!(store.last_reserved_page(), 8);

        store.fail_preallocation(true);
        for _ in 0..8 {
            space.add_page().unwrap();
        }
        assert_eq!(store.last_reserved_page(), 8);
        assert_eq!(space.estimated_page_count().unwrap(), 12);
    }

    #[test]
    fn reopen_sees_the_same_chain() {
        let store = MemPageStore::new();
        {
            let space = space(&store, 10);
            for _ in 0..25 {
                space.add_page().unwrap();
            }
        }
        let opts = SpaceOptions::default();
        let reopened: MemSpace<'_> =
            ContainerSpace::open(&store, &store, MemoryLog::new(), opts.clone(), 2, b"hdr".to_vec()).unwrap();
        assert_eq!(reopened.alloc_pages().unwrap(), vec![0, 11, 22]);
        assert_eq!(reopened.estimated_page_count().unwrap(), 25);
        let mismatch: Result<MemSpace<'_>> =
            ContainerSpace::open(&store, &store, MemoryLog::new(), opts, 2, b"header".to_vec());
        assert!(matches!(mismatch, Err(SpaceError::ContainerInfoChanged { old: 3, new: 6 })));
    }

    #[test]
    fn written_first_page_keeps_its_container_info() {
        let store = MemPageStore::new();
        let space = space(&store, 10);
        for _ in 0..12 {
            space.add_page().unwrap();
        }
        let opts = space.options().clone();
        let mut image = vec![0u8; opts.page_size];
        space.write_alloc_page(0, &mut image).unwrap();
        assert_eq!(AllocPage::read_container_info(&image).unwrap(), b"hdr");
        // The length byte written with the page already matches, so a second fill is accepted
        AllocPage::write_container_info(b"HDR", &mut image, false).unwrap();
        let loaded = AllocPage::load(PageKey::new(2, 0), &opts, &mut image).unwrap();
        assert_eq!(loaded.borrowed_space_len(), 3);
        assert_eq!(loaded.next_alloc_page_number(), Some(11));

        space.write_alloc_page(11, &mut image).unwrap();
        assert_eq!(AllocPage::read_container_info(&image).unwrap(), b"");
    }

    #[test]
    fn rollback_restores_the_chain() {
        let store = MemPageStore::new();
        let space = space(&store, 10);
        for _ in 0..12 {
            space.add_page().unwrap();
        }
        assert_eq!(space.estimated_page_count().unwrap(), 11);
        space.rollback().unwrap();
        {
            let first = store.latch_shared(0).unwrap();
            assert!(first.is_last());
            assert_eq!(first.extent().allocated_count(), 0);
        }
        assert_eq!(store.page_numbers(), vec![0]);

        // The space answers from the rolled back chain, not from what it cached before
        assert_eq!(space.alloc_pages().unwrap(), vec![0]);
        assert_eq!(space.estimated_page_count().unwrap(), 0);
        assert_eq!(space.page_status(12).unwrap(), None);
        assert_eq!(space.page_status(5).unwrap(), Some(PageStatus::Free));
        assert_eq!(space.allocation_page_for(12).unwrap(), None);

        // And allocation starts over, chaining a fresh page 11 once page 0 is full again
        for expected in 1..=10 {
            assert_eq!(space.add_page().unwrap(), expected);
        }
        assert_eq!(space.add_page().unwrap(), 12);
        assert_eq!(space.alloc_pages().unwrap(), vec![0, 11]);
        let walked: u32 = space
            .alloc_pages()
            .unwrap()
            .into_iter()
            .map(|n| store.latch_shared(n).unwrap().extent().allocated_count())
            .sum();
        assert_eq!(u64::from(walked), space.estimated_page_count().unwrap());
    }
}
