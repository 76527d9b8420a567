//! Allocation pages: one [`Extent`] per page, chained through the container.
//!
//! The first allocation page is page 0 of the container and manages the pages right after it. When
//! its extent is exhausted, a new allocation page is created just past its range and chained in,
//! and so on. Only the first page in the chain carries borrowed space, which the owning container
//! uses for its own header.
//!
//! Page layout, all integers big-endian:
//!
//! ```text
//! 0    generic page header (format id, version, page number, container)
//! 60   next allocation page number (u64::MAX if this is the last)
//! 68   next allocation page offset
//! 76   4 reserved u64s
//! 108  borrowed space length N
//! 109  N bytes of borrowed space, zeroed in the checksummed image
//! 109+N extent
//! ...  xxh3 checksum, last 8 bytes
//! ```

use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::{
    bitmap::PageBitmap,
    config::SpaceOptions,
    error::{Result, SpaceError},
    extent::{Extent, PageStatus},
    log::{AllocAction, AllocStatus, AllocationLog, LogInstant},
    page::{self, PageFrame, PageKey, ALLOC_PAGE_FORMAT_ID, CHECKSUM_LEN, PAGE_HEADER_LEN},
    store::PagePreallocator,
    FIRST_ALLOC_PAGE_NUMBER, INVALID_PAGE_NUMBER,
};

pub const ALLOC_PAGE_HEADER_OFFSET: usize = PAGE_HEADER_LEN;
pub const ALLOC_PAGE_HEADER_LEN: usize = 8 + 8 + 4 * 8;
pub const BORROWED_SPACE_OFFSET: usize = ALLOC_PAGE_HEADER_OFFSET + ALLOC_PAGE_HEADER_LEN;
pub const BORROWED_SPACE_LEN: usize = 1;
pub const MAX_BORROWED_SPACE: usize = u8::MAX as usize;

/// Fewest pages an allocation page must be able to manage.
const MIN_EXTENT_CAPACITY: u32 = 9;

/// Where the extent starts on a page with `borrowed` bytes of borrowed space.
#[inline]
fn extent_offset(borrowed: usize) -> usize {
    BORROWED_SPACE_OFFSET + BORROWED_SPACE_LEN + borrowed
}

/// Bytes left for the extent on a page of `page_size` bytes.
fn extent_space(page_size: usize, borrowed: usize) -> Option<usize> {
    page_size.checked_sub(extent_offset(borrowed) + CHECKSUM_LEN)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocPage {
    key: PageKey,
    version: u64,
    page_size: usize,
    next_alloc_page_number: u64,
    next_alloc_page_offset: u64,
    borrowed_space: u8,
    extent: Extent,
}

impl AllocPage {
    /// Format a fresh allocation page, managing the pages right after it.
    pub fn create(key: PageKey, options: &SpaceOptions, borrowed_space: usize) -> Result<Self> {
        options.validate()?;
        if borrowed_space > MAX_BORROWED_SPACE {
            return Err(SpaceError::ContainerInfoTooLarge {
                len: borrowed_space,
                max: MAX_BORROWED_SPACE,
            });
        }
        if borrowed_space != 0 && key.page_number != FIRST_ALLOC_PAGE_NUMBER {
            return Err(SpaceError::Config("only the first allocation page has borrowed space"));
        }
        let page_size = options.page_size;
        let budget = extent_space(page_size, borrowed_space)
            .map(Extent::max_pages_for_space)
            .unwrap_or(0);
        if budget < MIN_EXTENT_CAPACITY {
            return Err(SpaceError::PageTooSmall { page_size });
        }
        let capacity = match options.extent_capacity_limit {
            Some(limit) => limit.clamp(1, budget),
            None => budget,
        };

        let first_page = key.page_number + 1;
        let extent = Extent::new(first_page * page_size as u64, first_page, 0, capacity);
        tracing::debug!(
            container = key.container,
            alloc_page = key.page_number,
            capacity,
            "created allocation page"
        );
        Ok(Self {
            key,
            version: 0,
            page_size,
            next_alloc_page_number: INVALID_PAGE_NUMBER,
            next_alloc_page_offset: 0,
            borrowed_space: borrowed_space as u8,
            extent,
        })
    }

    /// Read an allocation page from its on-disk image.
    ///
    /// The borrowed space in `image` is zeroed, as it was when the checksum was computed.
    pub fn load(key: PageKey, options: &SpaceOptions, image: &mut [u8]) -> Result<Self> {
        let pn = key.page_number;
        options.validate()?;
        if image.len() != options.page_size {
            return Err(SpaceError::corrupt(pn, "page image has the wrong size"));
        }
        let borrowed = image[BORROWED_SPACE_OFFSET] as usize;
        if borrowed != 0 && pn != FIRST_ALLOC_PAGE_NUMBER {
            return Err(SpaceError::corrupt(pn, "borrowed space on a chained allocation page"));
        }
        let Some(space) = extent_space(image.len(), borrowed) else {
            return Err(SpaceError::corrupt(pn, "borrowed space overruns the page"));
        };
        let start = extent_offset(borrowed);
        image[BORROWED_SPACE_OFFSET + BORROWED_SPACE_LEN..start].fill(0);

        if !page::verify(image) {
            return Err(SpaceError::corrupt(pn, "checksum mismatch"));
        }
        let frame = PageFrame::read(image).ok_or_else(|| SpaceError::corrupt(pn, "truncated page header"))?;
        if frame.format_id != ALLOC_PAGE_FORMAT_ID {
            return Err(SpaceError::corrupt(pn, "not an allocation page"));
        }
        if frame.key != key {
            return Err(SpaceError::corrupt(pn, "page header names a different page"));
        }

        let mut header = Cursor::new(&image[ALLOC_PAGE_HEADER_OFFSET..BORROWED_SPACE_OFFSET]);
        let read_header = |c: &mut Cursor<&[u8]>| -> io::Result<(u64, u64)> {
            let next = c.read_u64::<BigEndian>()?;
            let offset = c.read_u64::<BigEndian>()?;
            Ok((next, offset))
        };
        let (next_alloc_page_number, next_alloc_page_offset) =
            read_header(&mut header).map_err(|_| SpaceError::corrupt(pn, "truncated allocation page header"))?;

        let extent = Extent::decode(&mut &image[start..start + space])
            .map_err(|_| SpaceError::corrupt(pn, "unreadable extent"))?;
        if extent.first_page() != pn + 1 {
            return Err(SpaceError::corrupt(pn, "extent doesn't follow its allocation page"));
        }
        let budget = Extent::max_pages_for_space(space) as u64;
        if extent.max_last_page() - extent.first_page() >= budget {
            return Err(SpaceError::corrupt(pn, "extent range exceeds what the page can manage"));
        }

        Ok(Self {
            key,
            version: frame.version,
            page_size: image.len(),
            next_alloc_page_number,
            next_alloc_page_offset,
            borrowed_space: borrowed as u8,
            extent,
        })
    }

    /// Write the page image. Borrowed space is left zeroed; the container fills it in with
    /// [`write_container_info`](Self::write_container_info) afterwards.
    ///
    /// # Panics
    ///
    /// Panics if `image` isn't exactly one page long.
    pub fn write(&self, image: &mut [u8]) -> Result<()> {
        assert_eq!(image.len(), self.page_size, "page image has the wrong size");
        image.fill(0);
        PageFrame {
            format_id: ALLOC_PAGE_FORMAT_ID,
            key: self.key,
            version: self.version,
        }
        .write(image);

        let mut header = Cursor::new(&mut image[ALLOC_PAGE_HEADER_OFFSET..]);
        header.write_u64::<BigEndian>(self.next_alloc_page_number)?;
        header.write_u64::<BigEndian>(self.next_alloc_page_offset)?;
        for _ in 0..4 {
            header.write_u64::<BigEndian>(0)?;
        }
        header.write_u8(self.borrowed_space)?;

        let start = extent_offset(self.borrowed_space as usize);
        let end = self.page_size - CHECKSUM_LEN;
        self.extent
            .encode(&mut &mut image[start..end])
            .map_err(|_| SpaceError::corrupt(self.key.page_number, "extent doesn't fit in its page"))?;
        page::seal(image);
        Ok(())
    }

    /// Store the container's header in the borrowed space of a written page image.
    ///
    /// On `create` the borrowed length is set from `info`; otherwise it must match what's there.
    pub fn write_container_info(info: &[u8], image: &mut [u8], create: bool) -> Result<()> {
        let len = info.len();
        let fits = image
            .len()
            .checked_sub(extent_offset(0) + CHECKSUM_LEN)
            .unwrap_or(0)
            .min(MAX_BORROWED_SPACE);
        if len > fits {
            return Err(SpaceError::ContainerInfoTooLarge { len, max: fits });
        }
        if create {
            image[BORROWED_SPACE_OFFSET] = len as u8;
        } else {
            let old = image[BORROWED_SPACE_OFFSET] as usize;
            if old != len {
                return Err(SpaceError::ContainerInfoChanged { old, new: len });
            }
        }
        let start = BORROWED_SPACE_OFFSET + BORROWED_SPACE_LEN;
        image[start..start + len].copy_from_slice(info);
        Ok(())
    }

    /// Read the container's header out of the borrowed space of a page image.
    pub fn read_container_info(image: &[u8]) -> Result<&[u8]> {
        let page_number = PageFrame::read(image).map_or(0, |f| f.key.page_number);
        let len = *image
            .get(BORROWED_SPACE_OFFSET)
            .ok_or_else(|| SpaceError::corrupt(page_number, "truncated allocation page header"))?
            as usize;
        let start = BORROWED_SPACE_OFFSET + BORROWED_SPACE_LEN;
        image
            .get(start..start + len)
            .ok_or_else(|| SpaceError::corrupt(page_number, "borrowed space overruns the page"))
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn page_number(&self) -> u64 {
        self.key.page_number
    }

    /// Instant of the last logged change applied to this page.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn borrowed_space_len(&self) -> usize {
        self.borrowed_space as usize
    }

    pub fn extent(&self) -> &Extent {
        &self.extent
    }

    pub fn is_last(&self) -> bool {
        self.next_alloc_page_number == INVALID_PAGE_NUMBER
    }

    pub fn next_alloc_page_number(&self) -> Option<u64> {
        (!self.is_last()).then_some(self.next_alloc_page_number)
    }

    pub fn next_alloc_page_offset(&self) -> Option<u64> {
        (!self.is_last()).then_some(self.next_alloc_page_offset)
    }

    /// Mark a page allocated. Only to be called by the log, on apply or redo.
    pub fn allocate_page(&mut self, instant: LogInstant, page: u64) -> Result<()> {
        self.extent.allocate(page)?;
        self.version = instant.get();
        tracing::trace!(alloc_page = self.key.page_number, page, "allocated page");
        Ok(())
    }

    /// Mark a page free. Only to be called by the log, on apply or redo.
    pub fn deallocate_page(&mut self, instant: LogInstant, page: u64) -> Result<()> {
        self.extent.deallocate(page)?;
        self.version = instant.get();
        tracing::trace!(alloc_page = self.key.page_number, page, "deallocated page");
        Ok(())
    }

    /// Point this page at the next one in the chain. Only to be called by the log.
    pub fn chain_to(&mut self, instant: LogInstant, next_page: u64, next_offset: u64) {
        self.next_alloc_page_number = next_page;
        self.next_alloc_page_offset = next_offset;
        self.version = instant.get();
    }

    pub fn log_allocate<L: AllocationLog + ?Sized>(&mut self, log: &mut L, page: u64) -> Result<LogInstant> {
        let action = AllocAction::SetPageStatus {
            page,
            new: AllocStatus::Allocated,
            old: AllocStatus::Free,
        };
        log.log_and_apply(self, action)
    }

    pub fn log_deallocate<L: AllocationLog + ?Sized>(&mut self, log: &mut L, page: u64) -> Result<LogInstant> {
        let action = AllocAction::SetPageStatus {
            page,
            new: AllocStatus::Deallocated,
            old: AllocStatus::Allocated,
        };
        log.log_and_apply(self, action)
    }

    pub fn log_chain<L: AllocationLog + ?Sized>(
        &mut self,
        log: &mut L,
        next_page: u64,
        next_offset: u64,
    ) -> Result<LogInstant> {
        let action = AllocAction::ChainAllocPage {
            next_page,
            next_offset,
            prev_next_page: self.next_alloc_page_number,
            prev_next_offset: self.next_alloc_page_offset,
        };
        log.log_and_apply(self, action)
    }

    /// The next page to allocate from this extent, searching from `hint`. The result may be past
    /// [`max_page_number`](Self::max_page_number) if the extent is full.
    pub fn next_free_page_number(&mut self, hint: Option<u64>) -> u64 {
        self.extent.find_free_page(hint)
    }

    /// Whether this page can supply a page to allocate.
    ///
    /// `last_allocated` is the most recently allocated page in the container. A page that isn't the
    /// last in the chain and whose range ends at or before it won't be asked, so that allocation
    /// keeps moving forward through the container.
    pub fn can_add_free_page(&self, last_allocated: Option<u64>) -> bool {
        if self.extent.is_retired() {
            return false;
        }
        if let Some(last) = last_allocated {
            if !self.is_last() && self.extent.end_page() <= last + 1 {
                return false;
            }
        }
        self.extent.can_add_free_page(last_allocated)
    }

    pub fn page_status(&self, page: u64) -> PageStatus {
        self.extent.page_status(page)
    }

    pub fn last_page_number(&self) -> Option<u64> {
        self.extent.last_page()
    }

    pub fn max_page_number(&self) -> u64 {
        self.extent.max_last_page()
    }

    pub fn last_preallocated_page_number(&self) -> u64 {
        self.extent.last_preallocated_page()
    }

    pub fn set_last_preallocated_page_number(&mut self, page: u64) {
        self.extent.set_last_preallocated_page(page)
    }

    /// Take back an unfilled map from a cached copy of this page's extent.
    pub fn update_unfilled_page_info(&mut self, unfilled: PageBitmap) {
        self.extent.update_unfilled_page_info(unfilled)
    }

    /// Ask the container to physically reserve pages ahead of use.
    ///
    /// Nothing happens until the extent has reserved `threshold` pages, so small containers don't
    /// grow ahead of need. The reservation isn't logged; after a crash the marker may be behind the
    /// file, which only costs a repeated reservation. Returns how many pages were reserved.
    pub fn preallocate<P: PagePreallocator + ?Sized>(
        &mut self,
        preallocator: &P,
        threshold: u64,
        batch: u32,
    ) -> u32 {
        let last = self.extent.last_preallocated_page();
        if last < threshold {
            return 0;
        }
        let room = self.extent.max_last_page().saturating_sub(last);
        let count = u64::from(batch).min(room) as u32;
        if count == 0 {
            return 0;
        }
        match preallocator.preallocate_pages(last, count) {
            Ok(0) => 0,
            Ok(done) => {
                self.extent.set_last_preallocated_page(last + u64::from(done));
                tracing::debug!(alloc_page = self.key.page_number, from = last, done, "preallocated pages");
                done
            }
            Err(e) => {
                tracing::warn!(alloc_page = self.key.page_number, error = %e, "page preallocation failed");
                0
            }
        }
    }
}
