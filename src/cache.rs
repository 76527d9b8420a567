//! Per-container index of allocation extents.
//!
//! The cache keeps one slot per allocation page in chain order, each remembering the page number,
//! the range of pages its extent covered when last seen, and a copy of the extent itself. A slot's
//! extent can be dropped (evicted) without losing its place in the chain; the next read that needs
//! it fetches it again.
//!
//! The chain of allocation pages is always the truth. Dropping the whole cache is always safe,
//! which is why invalidation can be coarse. The cache does no locking of its own: the owning
//! container serializes every call.

use crate::{
    alloc_page::AllocPage,
    config::SpaceOptions,
    error::{Result, SpaceError},
    extent::{Extent, PageStatus},
    store::AllocPageStore,
};

/// Page totals across every extent in a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceInfo {
    /// Pages currently allocated.
    pub allocated: u64,
    /// Pages in range but free for reuse.
    pub free: u64,
    /// Allocated pages marked unfilled.
    pub unfilled: u64,
}

#[derive(Debug)]
struct Slot {
    alloc_page: u64,
    /// First page covered, inclusive.
    low: u64,
    /// One past the last page covered.
    high: u64,
    extent: Option<Extent>,
    /// The cached unfilled map has edits the allocation page hasn't seen.
    dirty: bool,
}

impl Slot {
    fn new(page: &AllocPage) -> Self {
        let extent = page.extent().clone();
        Self {
            alloc_page: page.page_number(),
            low: extent.first_page(),
            high: extent.end_page(),
            extent: Some(extent),
            dirty: false,
        }
    }

    fn contains(&self, page: u64) -> bool {
        self.low <= page && page < self.high
    }

    /// Replace the cached extent with a fresh copy, carrying over any unfilled edits.
    fn refresh(&mut self, page: &AllocPage) {
        let mut extent = page.extent().clone();
        if self.dirty {
            if let Some(old) = self.extent.as_mut() {
                extent.update_unfilled_page_info(old.take_unfilled_bitmap());
            }
        }
        self.low = extent.first_page();
        self.high = extent.end_page();
        self.extent = Some(extent);
    }
}

#[derive(Debug)]
pub struct AllocationCache {
    slots: Vec<Slot>,
    valid: bool,
    strict: bool,
}

impl AllocationCache {
    pub fn new(options: &SpaceOptions) -> Self {
        Self {
            slots: Vec::new(),
            valid: false,
            strict: options.is_strict(),
        }
    }

    /// Whether the whole chain has been walked since the last invalidation.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Number of allocation pages discovered so far.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocation pages whose cached unfilled map hasn't been handed back yet.
    pub fn dirty_alloc_pages(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter(|s| s.dirty && s.extent.is_some())
            .map(|s| s.alloc_page)
            .collect()
    }

    fn needs_validation(&self) -> bool {
        !self.valid || self.slots.iter().any(|s| s.extent.is_none())
    }

    fn ensure_valid<S: AllocPageStore + ?Sized>(&mut self, store: &S, first_alloc_page: u64) -> Result<()> {
        if self.needs_validation() {
            self.validate(store, first_alloc_page)?;
        }
        Ok(())
    }

    /// Every cached extent, in chain order. Only complete after [`ensure_valid`].
    fn extents(&self) -> impl DoubleEndedIterator<Item = &Extent> + '_ {
        self.slots.iter().filter_map(|s| s.extent.as_ref())
    }

    /// The allocation page that manages `page`, or `None` if no allocation page covers it.
    pub fn get_allocation_page_number<S: AllocPageStore + ?Sized>(
        &mut self,
        store: &S,
        page: u64,
        first_alloc_page: u64,
    ) -> Result<Option<u64>> {
        if let Some(found) = self.lookup(page) {
            return Ok(Some(found));
        }
        if !self.needs_validation() {
            return Ok(None);
        }
        self.validate(store, first_alloc_page)?;
        Ok(self.lookup(page))
    }

    fn lookup(&self, page: u64) -> Option<u64> {
        let slot = self.slots.iter().find(|s| s.contains(page))?;
        tracing::trace!(page, alloc_page = slot.alloc_page, "allocation cache hit");
        Some(slot.alloc_page)
    }

    /// The highest page in range in the container, allocated or free.
    pub fn get_last_page_number<S: AllocPageStore + ?Sized>(
        &mut self,
        store: &S,
        first_alloc_page: u64,
    ) -> Result<Option<u64>> {
        self.ensure_valid(store, first_alloc_page)?;
        Ok(self.extents().rev().find_map(Extent::last_page))
    }

    /// The highest allocated page in the container.
    pub fn get_last_valid_page<S: AllocPageStore + ?Sized>(
        &mut self,
        store: &S,
        first_alloc_page: u64,
    ) -> Result<Option<u64>> {
        self.ensure_valid(store, first_alloc_page)?;
        Ok(self.extents().rev().find_map(Extent::last_valid_page))
    }

    /// The lowest allocated page after `after`, or the first allocated page if `after` is `None`.
    pub fn get_next_valid_page<S: AllocPageStore + ?Sized>(
        &mut self,
        store: &S,
        after: Option<u64>,
        first_alloc_page: u64,
    ) -> Result<Option<u64>> {
        self.ensure_valid(store, first_alloc_page)?;
        Ok(self
            .extents()
            .filter(|e| after.map_or(true, |a| e.end_page() > a + 1))
            .find_map(|e| e.next_valid_page(after)))
    }

    /// Status of `page`, or `None` if no extent has it in range.
    pub fn get_page_status<S: AllocPageStore + ?Sized>(
        &mut self,
        store: &S,
        page: u64,
        first_alloc_page: u64,
    ) -> Result<Option<PageStatus>> {
        self.ensure_valid(store, first_alloc_page)?;
        Ok(self
            .extents()
            .find(|e| e.contains(page))
            .map(|e| e.page_status(page)))
    }

    /// Number of allocated pages in the container.
    pub fn get_estimated_page_count<S: AllocPageStore + ?Sized>(
        &mut self,
        store: &S,
        first_alloc_page: u64,
    ) -> Result<u64> {
        self.ensure_valid(store, first_alloc_page)?;
        Ok(self.extents().map(|e| u64::from(e.allocated_count())).sum())
    }

    pub fn get_all_page_counts<S: AllocPageStore + ?Sized>(
        &mut self,
        store: &S,
        first_alloc_page: u64,
    ) -> Result<SpaceInfo> {
        self.ensure_valid(store, first_alloc_page)?;
        let mut info = SpaceInfo::default();
        for ext in self.extents() {
            let allocated = ext.allocated_count();
            let unfilled = ext.unfilled_count();
            if self.strict {
                assert!(
                    unfilled <= allocated,
                    "extent at {} has {unfilled} unfilled pages but only {allocated} allocated",
                    ext.first_page()
                );
            }
            info.allocated += u64::from(allocated);
            info.unfilled += u64::from(unfilled);
            info.free += u64::from(ext.total_capacity_in_use() - allocated);
        }
        Ok(info)
    }

    /// An unfilled page to try inserting into, skipping `excluding` if it would be the first pick.
    pub fn get_unfilled_page_number<S: AllocPageStore + ?Sized>(
        &mut self,
        store: &S,
        excluding: Option<u64>,
        first_alloc_page: u64,
    ) -> Result<Option<u64>> {
        self.ensure_valid(store, first_alloc_page)?;
        Ok(self
            .extents()
            .filter(|e| e.may_have_unfilled_page())
            .find_map(|e| e.find_unfilled_page(excluding)))
    }

    /// Mark a page unfilled or not in the cached extent.
    ///
    /// This is only a hint, so it never triggers validation: with no valid cached extent for the
    /// page, nothing happens. The edit reaches the allocation page when its slot is next
    /// invalidated with the page in hand.
    pub fn track_unfilled(&mut self, page: u64, is_unfilled: bool) {
        if !self.valid {
            return;
        }
        let Some(slot) = self.slots.iter_mut().find(|s| s.contains(page)) else {
            return;
        };
        let Some(extent) = slot.extent.as_mut() else {
            return;
        };
        if extent.track_unfilled(page, is_unfilled) {
            slot.dirty = true;
        }
    }

    /// Drop every cached extent. Unfilled edits not yet handed back are lost.
    pub fn invalidate(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.extent = None;
            slot.dirty = false;
        }
        self.valid = false;
    }

    /// Drop the cached extent of one allocation page.
    ///
    /// Must be called after every change to the allocation page, before anyone else can read
    /// through the cache. If the cached extent has unfilled edits and the page is at hand, the
    /// edits move to the page.
    pub fn invalidate_one(&mut self, alloc_page: Option<&mut AllocPage>, alloc_page_number: u64) {
        let Some(slot) = self.slots.iter_mut().find(|s| s.alloc_page == alloc_page_number) else {
            let beyond = self.slots.last().map_or(true, |s| alloc_page_number >= s.high);
            if !beyond {
                // Not an allocation page we know of, yet inside the known ranges.
                tracing::debug!(alloc_page = alloc_page_number, "unknown allocation page, dropping the cache");
                self.invalidate();
            }
            return;
        };
        if let (true, Some(extent), Some(page)) = (slot.dirty, slot.extent.as_mut(), alloc_page) {
            page.update_unfilled_page_info(extent.take_unfilled_bitmap());
        }
        slot.dirty = false;
        slot.extent = None;
    }

    /// Drop the last cached extent, after the last allocation page grew or was chained to a new one.
    pub fn invalidate_last(&mut self) {
        if let Some(slot) = self.slots.last_mut() {
            slot.extent = None;
            slot.dirty = false;
        }
        self.valid = false;
    }

    /// Forget everything, including the chain.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.valid = false;
    }

    /// Bring the cache in line with the allocation page chain starting at `first_alloc_page`.
    pub fn validate<S: AllocPageStore + ?Sized>(&mut self, store: &S, first_alloc_page: u64) -> Result<()> {
        let mut next = if self.slots.is_empty() {
            Some(first_alloc_page)
        } else {
            self.revalidate(store)?
        };
        while let Some(number) = next {
            if let Some(prev) = self.slots.last() {
                if number <= prev.alloc_page {
                    return Err(SpaceError::corrupt(prev.alloc_page, "allocation page chain goes backwards"));
                }
            }
            let page = store.latch_shared(number)?;
            self.slots.push(Slot::new(&page));
            next = page.next_alloc_page_number();
        }
        self.valid = true;
        tracing::debug!(alloc_pages = self.slots.len(), "allocation cache validated");
        Ok(())
    }

    /// Refill evicted slots and refresh the last one, returning where the chain continues past it.
    fn revalidate<S: AllocPageStore + ?Sized>(&mut self, store: &S) -> Result<Option<u64>> {
        let last = self.slots.len() - 1;
        for i in 0..last {
            if self.slots[i].extent.is_some() {
                continue;
            }
            let expected_next = self.slots[i + 1].alloc_page;
            let slot = &mut self.slots[i];
            let page = store.latch_shared(slot.alloc_page)?;
            if self.strict && page.next_alloc_page_number() != Some(expected_next) {
                return Err(SpaceError::corrupt(
                    slot.alloc_page,
                    "allocation page no longer chains to the page after it",
                ));
            }
            slot.refresh(&page);
        }
        let slot = &mut self.slots[last];
        let page = store.latch_shared(slot.alloc_page)?;
        slot.refresh(&page);
        Ok(page.next_alloc_page_number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        log::MemoryLog,
        page::PageKey,
        store::{AllocPageStore, MemPageStore},
    };

    const CONTAINER: u64 = 4;

    fn options(capacity: u32) -> SpaceOptions {
        let mut opts = SpaceOptions::default();
        opts.strict(true).extent_capacity_limit(capacity);
        opts
    }

    /// Build a chain of allocation pages, each managing `capacity` pages, allocating `filled` pages
    /// in each.
    fn build_chain(opts: &SpaceOptions, filled: &[u32]) -> (MemPageStore, MemoryLog) {
        let store = MemPageStore::new();
        let mut log = MemoryLog::new();
        let mut number = 0;
        let mut prev: Option<u64> = None;
        for (i, &count) in filled.iter().enumerate() {
            let page = AllocPage::create(PageKey::new(CONTAINER, number), opts, 0).unwrap();
            let mut page = store.create_alloc_page(page).unwrap();
            for n in 0..count {
                page.log_allocate(&mut log, number + 1 + n as u64).unwrap();
            }
            let next = page.max_page_number() + 1;
            drop(page);
            if let Some(p) = prev {
                let mut prev_page = store.latch_exclusive(p).unwrap();
                prev_page.log_chain(&mut log, number, number * 4096).unwrap();
            }
            prev = Some(number);
            if i + 1 < filled.len() {
                number = next;
            }
        }
        store.reset_fetches();
        (store, log)
    }

    /// Walk the chain directly, without the cache.
    fn chain_extents(store: &MemPageStore) -> Vec<Extent> {
        let mut out = Vec::new();
        let mut next = Some(0);
        while let Some(n) = next {
            let page = store.latch_shared(n).unwrap();
            out.push(page.extent().clone());
            next = page.next_alloc_page_number();
        }
        out
    }

    #[test]
    fn lookup_reads_only_what_it_needs() {
        let opts = options(99);
        let (store, _log) = build_chain(&opts, &[99, 99, 99]);
        assert_eq!(store.page_numbers(), vec![0, 100, 200]);

        let mut cache = AllocationCache::new(&opts);
        cache.validate(&store, 0).unwrap();
        assert!(cache.is_valid());
        assert_eq!(cache.len(), 3);
        store.reset_fetches();

        assert_eq!(cache.get_allocation_page_number(&store, 150, 0).unwrap(), Some(100));
        assert_eq!(store.fetch_count(0), 0);
        assert_eq!(store.fetch_count(100), 0);
        assert_eq!(store.fetch_count(200), 0);

        // After one page is dropped, only that page is read again
        cache.invalidate_one(None, 100);
        assert_eq!(cache.get_page_status(&store, 150, 0).unwrap(), Some(PageStatus::Allocated));
        assert_eq!(store.fetch_count(0), 0);
        assert_eq!(store.fetch_count(100), 1);
        // The last page is always re-read to look for growth
        assert_eq!(store.fetch_count(200), 1);
    }

    #[test]
    fn miss_on_an_invalid_cache_validates() {
        let opts = options(20);
        let (store, _log) = build_chain(&opts, &[20, 5]);
        let mut cache = AllocationCache::new(&opts);
        assert_eq!(cache.get_allocation_page_number(&store, 23, 0).unwrap(), Some(21));
        assert!(cache.is_valid());
        store.reset_fetches();
        // Past every range on a valid cache: no fetches
        assert_eq!(cache.get_allocation_page_number(&store, 40, 0).unwrap(), None);
        assert_eq!(store.total_fetches(), 0);
        // The allocation pages themselves aren't managed by anyone
        assert_eq!(cache.get_allocation_page_number(&store, 21, 0).unwrap(), None);
    }

    #[test]
    fn matches_a_direct_chain_walk() {
        let opts = options(16);
        let (store, mut log) = build_chain(&opts, &[16, 16, 9]);
        for (alloc, page) in [(0, 3), (0, 16), (17, 20), (17, 33), (34, 35), (34, 43)] {
            let mut alloc_page = store.latch_exclusive(alloc).unwrap();
            alloc_page.log_deallocate(&mut log, page).unwrap();
        }

        let mut cache = AllocationCache::new(&opts);
        for round in 0..2 {
            if round == 1 {
                cache.invalidate();
            }
            let truth = chain_extents(&store);
            for page in 0..60 {
                let expected = truth.iter().find(|e| e.contains(page)).map(|e| e.page_status(page));
                assert_eq!(cache.get_page_status(&store, page, 0).unwrap(), expected, "page {page}");
                let next = truth.iter().find_map(|e| e.next_valid_page(Some(page)));
                assert_eq!(cache.get_next_valid_page(&store, Some(page), 0).unwrap(), next, "after {page}");
            }
            assert_eq!(cache.get_next_valid_page(&store, None, 0).unwrap(), Some(1));
            let last_valid = truth.iter().rev().find_map(Extent::last_valid_page);
            assert_eq!(cache.get_last_valid_page(&store, 0).unwrap(), last_valid);
            assert_eq!(last_valid, Some(42));
            assert_eq!(cache.get_last_page_number(&store, 0).unwrap(), Some(43));
        }

        let info = cache.get_all_page_counts(&store, 0).unwrap();
        assert_eq!(
            info,
            SpaceInfo {
                allocated: 41 - 6,
                free: 6,
                unfilled: 0
            }
        );
        assert_eq!(cache.get_estimated_page_count(&store, 0).unwrap(), 35);
    }

    #[test]
    fn revalidation_follows_chain_growth() {
        let opts = options(10);
        let (store, mut log) = build_chain(&opts, &[10]);
        let mut cache = AllocationCache::new(&opts);
        assert_eq!(cache.get_last_page_number(&store, 0).unwrap(), Some(10));

        // Chain a new page the way the container does, then drop the last slot
        let new = AllocPage::create(PageKey::new(CONTAINER, 11), &opts, 0).unwrap();
        let mut new = store.create_alloc_page(new).unwrap();
        new.log_allocate(&mut log, 12).unwrap();
        drop(new);
        store.latch_exclusive(0).unwrap().log_chain(&mut log, 11, 11 * 4096).unwrap();
        cache.invalidate_last();

        assert_eq!(cache.get_allocation_page_number(&store, 12, 0).unwrap(), Some(11));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_last_page_number(&store, 0).unwrap(), Some(12));
    }

    #[test]
    #[cfg_attr(not(debug_assertions), ignore = "chain checks only run in debug builds")]
    fn broken_chain_is_corruption() {
        let opts = options(10);
        let (store, mut log) = build_chain(&opts, &[10, 10, 3]);
        let mut cache = AllocationCache::new(&opts);
        cache.validate(&store, 0).unwrap();

        // Point the first page past the second one
        store.latch_exclusive(0).unwrap().log_chain(&mut log, 22, 22 * 4096).unwrap();
        cache.invalidate_one(None, 0);
        let err = cache.get_estimated_page_count(&store, 0).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn unfilled_edits_move_to_the_page() {
        let opts = options(16);
        let (store, _log) = build_chain(&opts, &[12]);
        let mut cache = AllocationCache::new(&opts);

        // Cold cache: nothing happens
        cache.track_unfilled(4, true);
        assert!(cache.dirty_alloc_pages().is_empty());

        cache.validate(&store, 0).unwrap();
        cache.track_unfilled(4, true);
        cache.track_unfilled(9, true);
        cache.track_unfilled(9, false);
        assert_eq!(cache.dirty_alloc_pages(), vec![0]);
        assert_eq!(cache.get_unfilled_page_number(&store, None, 0).unwrap(), Some(4));
        assert_eq!(cache.get_unfilled_page_number(&store, Some(4), 0).unwrap(), None);
        // The live page hasn't seen it yet
        assert_eq!(store.latch_shared(0).unwrap().extent().find_unfilled_page(None), None);

        {
            let mut page = store.latch_exclusive(0).unwrap();
            cache.invalidate_one(Some(&mut *page), 0);
            assert_eq!(page.extent().find_unfilled_page(None), Some(4));
        }
        assert!(cache.dirty_alloc_pages().is_empty());
        assert_eq!(cache.get_unfilled_page_number(&store, None, 0).unwrap(), Some(4));
        assert_eq!(cache.get_all_page_counts(&store, 0).unwrap().unfilled, 1);
    }

    #[test]
    fn unfilled_edits_survive_refresh_of_last_slot() {
        let opts = options(16);
        let (store, _log) = build_chain(&opts, &[12]);
        let mut cache = AllocationCache::new(&opts);
        cache.validate(&store, 0).unwrap();
        cache.track_unfilled(7, true);
        cache.validate(&store, 0).unwrap();
        assert_eq!(cache.get_unfilled_page_number(&store, None, 0).unwrap(), Some(7));
        assert_eq!(cache.dirty_alloc_pages(), vec![0]);
    }

    #[test]
    fn invalidation_of_unknown_pages() {
        let opts = options(10);
        let (store, _log) = build_chain(&opts, &[10, 4]);
        let mut cache = AllocationCache::new(&opts);
        cache.validate(&store, 0).unwrap();

        // A brand new allocation page past everything known: nothing to do
        cache.invalidate_one(None, 100);
        assert!(cache.is_valid());
        assert!(!cache.needs_validation());

        // Something inside the known ranges that isn't an allocation page: start over
        cache.invalidate_one(None, 5);
        assert!(!cache.is_valid());

        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.get_estimated_page_count(&store, 0).unwrap(), 14);
        assert_eq!(cache.len(), 2);
    }
}
