//! The allocation extent: free and unfilled bitmaps over a contiguous run of logical pages.
//!
//! An extent is plain data. It does no I/O and takes no locks; whoever holds it (an
//! [`AllocPage`](crate::AllocPage) under its latch, or the allocation cache under the container's
//! lock) is responsible for serializing access.
//!
//! The `HAS_FREE` and `HAS_UNFILLED` status bits are hints. They may claim a free or unfilled page
//! exists when none does, but never the reverse. Clearing one after a scan comes up empty is an
//! unlogged in-memory update; losing it in a crash only costs a later scan.

use std::io;

use bitflags::bitflags;
use byteorder::{BigEndian, WriteBytesExt};

use crate::{
    bitmap::{PageBitmap, BITMAP_PREFIX_LEN},
    error::{Result, SpaceError},
};

mod format;
pub use format::LegacyLayout;

/// Bytes taken by the fixed fields of an encoded extent.
///
/// offset(8) + start(8) + end(8) + length(4) + status(4) + prealloc(4) + reserved(4 + 8 + 8)
pub const EXTENT_HEADER_LEN: usize = 56;

bitflags! {
    /// Extent status bits, as stored on disk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtentStatus: u32 {
        /// Legacy marker for a separate deallocated-page map. Never set by this crate.
        const HAS_DEALLOCATED = 0x1;
        /// The extent may have a free page.
        const HAS_FREE = 0x2;
        /// Every page was free when the extent was created.
        const ALL_FREE = 0x4;
        /// The extent must not hand out any more pages.
        const RETIRED = 0x8;
        /// The extent may have an unfilled page.
        const HAS_UNFILLED = 0x10;
        /// An unfilled-page map follows the free-page map on disk.
        const KEEP_UNFILLED_MAP = 0x1000_0000;
        /// No legacy deallocated-page map follows the free-page map on disk.
        const NO_LEGACY_DEALLOC_MAP = 0x2000_0000;
    }
}

/// The state of a single in-range page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageStatus {
    Allocated,
    Free,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extent {
    offset: u64,
    first_page: u64,
    max_last_page: u64,
    allocated_length: u32,
    preallocated_length: u32,
    status: ExtentStatus,
    free: PageBitmap,
    unfilled: PageBitmap,
}

/// Bitmap length for `pages` pages: the next multiple of 8 above the last bit, capped at capacity.
#[inline]
fn bitmap_bits_for(bit: u32, capacity: u32) -> u32 {
    ((1 + bit / 8) * 8).min(capacity)
}

impl Extent {
    /// Create an extent managing `capacity` pages starting at `first_page`, of which the first
    /// `already_allocated` exist and are free.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `already_allocated` exceeds it.
    pub fn new(offset: u64, first_page: u64, already_allocated: u32, capacity: u32) -> Self {
        assert!(capacity > 0, "an extent must manage at least one page");
        assert!(
            already_allocated <= capacity,
            "{already_allocated} pages can't fit in an extent of {capacity}"
        );
        let mut status = ExtentStatus::KEEP_UNFILLED_MAP | ExtentStatus::NO_LEGACY_DEALLOC_MAP;
        if already_allocated > 0 {
            status |= ExtentStatus::HAS_FREE | ExtentStatus::ALL_FREE;
        }
        let bits = bitmap_bits_for(already_allocated, capacity);
        let mut free = PageBitmap::new(bits);
        for i in 0..already_allocated {
            free.set(i);
        }
        Self {
            offset,
            first_page,
            max_last_page: first_page + capacity as u64 - 1,
            allocated_length: already_allocated,
            preallocated_length: already_allocated,
            status,
            free,
            unfilled: PageBitmap::new(bits),
        }
    }

    /// How many pages an extent could manage if it had `available` bytes for its encoding.
    ///
    /// After the fixed header, each of the two bitmaps gets a third of the remaining space (the
    /// last third is slack for a legacy dealloc map), less its own length prefix.
    pub fn max_pages_for_space(available: usize) -> u32 {
        let Some(rest) = available.checked_sub(EXTENT_HEADER_LEN) else {
            return 0;
        };
        let Some(map_bytes) = (rest / 3).checked_sub(BITMAP_PREFIX_LEN) else {
            return 0;
        };
        u32::try_from(map_bytes * 8).unwrap_or(u32::MAX)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn first_page(&self) -> u64 {
        self.first_page
    }

    /// The largest page number this extent can ever manage.
    pub fn max_last_page(&self) -> u64 {
        self.max_last_page
    }

    /// The last page currently in range, or `None` if no page has been allocated yet.
    pub fn last_page(&self) -> Option<u64> {
        (self.allocated_length > 0).then(|| self.first_page + self.allocated_length as u64 - 1)
    }

    /// One past the last page currently in range.
    pub fn end_page(&self) -> u64 {
        self.first_page + self.allocated_length as u64
    }

    pub fn capacity(&self) -> u32 {
        (self.max_last_page - self.first_page + 1) as u32
    }

    pub fn allocated_length(&self) -> u32 {
        self.allocated_length
    }

    pub fn preallocated_length(&self) -> u32 {
        self.preallocated_length
    }

    pub fn status(&self) -> ExtentStatus {
        self.status
    }

    pub fn free_bitmap(&self) -> &PageBitmap {
        &self.free
    }

    pub fn unfilled_bitmap(&self) -> &PageBitmap {
        &self.unfilled
    }

    pub fn is_retired(&self) -> bool {
        self.status.contains(ExtentStatus::RETIRED)
    }

    pub fn may_have_free_page(&self) -> bool {
        self.status.contains(ExtentStatus::HAS_FREE)
    }

    pub fn may_have_unfilled_page(&self) -> bool {
        self.status.contains(ExtentStatus::HAS_UNFILLED)
    }

    pub fn contains(&self, page: u64) -> bool {
        page >= self.first_page && page < self.end_page()
    }

    /// Bit index of an in-range page.
    ///
    /// # Panics
    ///
    /// Panics if the page is not currently in range.
    fn bit(&self, page: u64) -> u32 {
        assert!(
            self.contains(page),
            "page {page} is outside of extent range {}..{}",
            self.first_page,
            self.end_page()
        );
        (page - self.first_page) as u32
    }

    /// Mark a page as allocated, growing the extent if the page is the next one past the end.
    ///
    /// # Panics
    ///
    /// Panics if the page is in range but not free, or if it lies past the end with a gap.
    pub fn allocate(&mut self, page: u64) -> Result<()> {
        if page < self.first_page || page > self.max_last_page {
            return Err(SpaceError::PageOutOfRange { page });
        }
        let bit = (page - self.first_page) as u32;
        if bit < self.allocated_length {
            assert!(self.free.is_set(bit), "reallocating page {page}, which is not free");
        } else {
            assert_eq!(
                bit, self.allocated_length,
                "allocating page {page} would skip pages in the extent"
            );
        }

        if bit >= self.free.len_bits() {
            let bits = bitmap_bits_for(bit, self.capacity());
            self.free.grow(bits);
            self.unfilled.grow(bits);
        }
        if bit >= self.allocated_length {
            self.allocated_length = bit + 1;
            self.preallocated_length = self.preallocated_length.max(self.allocated_length);
        }
        // A freshly allocated page is empty, but only pages that were filled and later drained
        // are tracked as unfilled, so the unfilled bit stays clear.
        self.free.clear(bit);
        Ok(())
    }

    /// Mark an in-range page as free.
    ///
    /// # Panics
    ///
    /// Panics if the page is already free.
    pub fn deallocate(&mut self, page: u64) -> Result<()> {
        if !self.contains(page) {
            return Err(SpaceError::PageOutOfRange { page });
        }
        let bit = (page - self.first_page) as u32;
        assert!(!self.free.is_set(bit), "deallocating page {page}, which is already free");
        self.free.set(bit);
        self.unfilled.clear(bit);
        self.status.insert(ExtentStatus::HAS_FREE);
        Ok(())
    }

    /// Pick the page to allocate next.
    ///
    /// Free pages are reused first, scanning from `hint` (inclusive) or from the start of the
    /// extent when there's no hint or it precedes the extent. With nothing to reuse, this returns
    /// the page one past the end; the caller must check it against
    /// [`max_last_page`](Self::max_last_page).
    pub fn find_free_page(&mut self, hint: Option<u64>) -> u64 {
        if self.may_have_free_page() {
            let full_scan = hint.map_or(true, |h| h < self.first_page);
            let found = match hint {
                Some(h) if !full_scan => u32::try_from(h - self.first_page)
                    .ok()
                    .and_then(|start| self.free.first_set_from(start)),
                _ => self.free.first_set(),
            };
            if let Some(bit) = found {
                assert!(bit < self.allocated_length, "free bit {bit} is past the extent length");
                return self.first_page + bit as u64;
            }
            // Only a scan of the whole map proves the hint wrong. A scan that started mid-extent
            // may have skipped free pages below the hint.
            if full_scan {
                tracing::trace!(first_page = self.first_page, "clearing stale free-page hint");
                self.status.remove(ExtentStatus::HAS_FREE);
            }
        }
        self.end_page()
    }

    /// Whether a page could be added to this extent, either by reuse or by growth.
    pub fn can_add_free_page(&self, last_allocated: Option<u64>) -> bool {
        if self.end_page() <= self.max_last_page {
            return true;
        }
        if !self.may_have_free_page() {
            return false;
        }
        match last_allocated {
            Some(h) if h >= self.first_page => u32::try_from(h - self.first_page)
                .ok()
                .and_then(|start| self.free.first_set_from(start))
                .is_some(),
            _ => self.free.first_set().is_some(),
        }
    }

    /// Set or clear the unfilled mark on an in-range page, returning whether anything changed.
    ///
    /// Free pages are never marked unfilled.
    pub fn track_unfilled(&mut self, page: u64, is_unfilled: bool) -> bool {
        let bit = self.bit(page);
        if self.unfilled.is_set(bit) == is_unfilled {
            return false;
        }
        if is_unfilled {
            if self.free.is_set(bit) {
                return false;
            }
            self.unfilled.set(bit);
            self.status.insert(ExtentStatus::HAS_UNFILLED);
        } else {
            self.unfilled.clear(bit);
        }
        true
    }

    /// Find an unfilled page, skipping `excluding` if it would be the first pick.
    ///
    /// `excluding` is a page that was just rejected as too full for a particular insert. It's still
    /// unfilled, so the mark stays, but the next candidate is offered instead.
    pub fn find_unfilled_page(&self, excluding: Option<u64>) -> Option<u64> {
        if !self.may_have_unfilled_page() {
            return None;
        }
        let first = self.unfilled.first_set()?;
        let page = self.first_page + first as u64;
        if Some(page) != excluding {
            return Some(page);
        }
        self.unfilled
            .first_set_from(first + 1)
            .map(|bit| self.first_page + bit as u64)
    }

    /// Status of an in-range page.
    ///
    /// # Panics
    ///
    /// Panics if the page is not in range.
    pub fn page_status(&self, page: u64) -> PageStatus {
        if self.free.is_set(self.bit(page)) {
            PageStatus::Free
        } else {
            PageStatus::Allocated
        }
    }

    /// Number of in-range pages that are allocated.
    pub fn allocated_count(&self) -> u32 {
        if !self.may_have_free_page() {
            return self.allocated_length;
        }
        self.allocated_length.saturating_sub(self.free.count_set())
    }

    /// Number of allocated pages marked unfilled.
    pub fn unfilled_count(&self) -> u32 {
        self.unfilled.iter_set().filter(|bit| !self.free.is_set(*bit)).count() as u32
    }

    /// Number of pages in range, free or allocated.
    pub fn total_capacity_in_use(&self) -> u32 {
        self.allocated_length
    }

    /// The highest allocated page, if any.
    pub fn last_valid_page(&self) -> Option<u64> {
        (0..self.allocated_length)
            .rev()
            .find(|bit| !self.free.is_set(*bit))
            .map(|bit| self.first_page + bit as u64)
    }

    /// The lowest allocated page after `after`, or from the start of the extent if `None`.
    pub fn next_valid_page(&self, after: Option<u64>) -> Option<u64> {
        let start = match after {
            Some(a) if a >= self.first_page => a + 1,
            _ => self.first_page,
        };
        (start..self.end_page()).find(|page| !self.free.is_set((page - self.first_page) as u32))
    }

    /// The last page physically reserved on disk.
    pub fn last_preallocated_page(&self) -> u64 {
        let len = self.preallocated_length.max(self.allocated_length);
        (self.first_page + len as u64).saturating_sub(1)
    }

    /// Record that pages up to `page` are physically reserved. Capped at the extent's capacity;
    /// never lowers the mark.
    pub fn set_last_preallocated_page(&mut self, page: u64) {
        let page = page.min(self.max_last_page);
        if page < self.first_page {
            return;
        }
        let len = (page - self.first_page + 1) as u32;
        self.preallocated_length = self.preallocated_length.max(len);
    }

    /// Move the unfilled map out, leaving an empty one of the same length behind.
    pub fn take_unfilled_bitmap(&mut self) -> PageBitmap {
        self.status.remove(ExtentStatus::HAS_UNFILLED);
        let empty = PageBitmap::new(self.unfilled.len_bits());
        std::mem::replace(&mut self.unfilled, empty)
    }

    /// Replace the unfilled map with one handed back from a cached copy of this extent.
    ///
    /// Pages freed since the copy was taken lose their unfilled mark.
    pub fn update_unfilled_page_info(&mut self, mut unfilled: PageBitmap) {
        unfilled.grow(self.free.len_bits());
        let stale: Vec<u32> = unfilled
            .iter_set()
            .filter(|bit| *bit >= self.allocated_length || self.free.is_set(*bit))
            .collect();
        for bit in stale {
            unfilled.clear(bit);
        }
        self.status.set(ExtentStatus::HAS_UNFILLED, unfilled.first_set().is_some());
        self.unfilled = unfilled;
    }

    /// Number of bytes [`encode`](Self::encode) produces.
    pub fn encoded_len(&self) -> usize {
        EXTENT_HEADER_LEN + self.free.encoded_len() + self.unfilled.encoded_len()
    }

    /// Write the current on-disk encoding: fixed fields, free map, unfilled map.
    pub fn encode<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        let status = self.status | ExtentStatus::KEEP_UNFILLED_MAP | ExtentStatus::NO_LEGACY_DEALLOC_MAP;
        w.write_u64::<BigEndian>(self.offset)?;
        w.write_u64::<BigEndian>(self.first_page)?;
        w.write_u64::<BigEndian>(self.max_last_page)?;
        w.write_u32::<BigEndian>(self.allocated_length)?;
        w.write_u32::<BigEndian>(status.bits())?;
        w.write_u32::<BigEndian>(self.preallocated_length)?;
        w.write_u32::<BigEndian>(0)?;
        w.write_u64::<BigEndian>(0)?;
        w.write_u64::<BigEndian>(0)?;
        self.free.write_to(w)?;
        self.unfilled.write_to(w)
    }

    /// Read an extent in any supported on-disk version.
    pub fn decode<R: io::Read>(r: &mut R) -> io::Result<Self> {
        format::decode(r)
    }
}
