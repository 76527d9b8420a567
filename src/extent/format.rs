//! Versioned decoding of the on-disk extent.
//!
//! Older stores wrote extents in two layouts that differ from the current one:
//!
//! - Before the unfilled-page map existed, nothing followed the free-page map and
//!   `KEEP_UNFILLED_MAP` was unset.
//! - Before deallocated pages were folded into the free map, a separate dealloc map followed the
//!   free map and `NO_LEGACY_DEALLOC_MAP` was unset.
//!
//! Both are read here into a raw form and normalized into the current in-memory layout, so nothing
//! else has to know they exist. The next write stores the current layout.

use std::io;

use byteorder::{BigEndian, ReadBytesExt};

use super::{Extent, ExtentStatus};
use crate::bitmap::PageBitmap;

/// Which optional sections follow the free-page map on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyLayout {
    /// A separate deallocated-page map follows the free map.
    pub dealloc_map: bool,
    /// An unfilled-page map is present.
    pub unfilled_map: bool,
}

impl LegacyLayout {
    /// The current layout: no dealloc map, unfilled map present.
    pub const CURRENT: Self = Self {
        dealloc_map: false,
        unfilled_map: true,
    };

    pub fn from_status(status: ExtentStatus) -> Self {
        Self {
            dealloc_map: !status.contains(ExtentStatus::NO_LEGACY_DEALLOC_MAP),
            unfilled_map: status.contains(ExtentStatus::KEEP_UNFILLED_MAP),
        }
    }
}

/// An extent exactly as it was found on disk.
struct RawExtent {
    offset: u64,
    start: u64,
    end: u64,
    length: u32,
    status: ExtentStatus,
    prealloc_length: u32,
    free: PageBitmap,
    dealloc: Option<PageBitmap>,
    unfilled: Option<PageBitmap>,
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl RawExtent {
    fn read<R: io::Read>(r: &mut R) -> io::Result<Self> {
        let offset = r.read_u64::<BigEndian>()?;
        let start = r.read_u64::<BigEndian>()?;
        let end = r.read_u64::<BigEndian>()?;
        let length = r.read_u32::<BigEndian>()?;
        let status = ExtentStatus::from_bits_retain(r.read_u32::<BigEndian>()?);
        let prealloc_length = r.read_u32::<BigEndian>()?;
        // reserved
        r.read_u32::<BigEndian>()?;
        r.read_u64::<BigEndian>()?;
        r.read_u64::<BigEndian>()?;

        let layout = LegacyLayout::from_status(status);
        let free = PageBitmap::read_from(r)?;
        let dealloc = if layout.dealloc_map {
            Some(PageBitmap::read_from(r)?)
        } else {
            None
        };
        let unfilled = if layout.unfilled_map {
            Some(PageBitmap::read_from(r)?)
        } else {
            None
        };
        Ok(Self {
            offset,
            start,
            end,
            length,
            status,
            prealloc_length,
            free,
            dealloc,
            unfilled,
        })
    }

    fn normalize(self) -> io::Result<Extent> {
        if self.end < self.start {
            return Err(invalid("extent ends before it starts"));
        }
        let capacity =
            u32::try_from(self.end - self.start + 1).map_err(|_| invalid("extent range too large"))?;
        if self.length > capacity {
            return Err(invalid("extent length exceeds its range"));
        }

        let mut status = self.status;
        let mut free = self.free;
        if let Some(dealloc) = self.dealloc {
            // Deallocated pages are free once the deallocation committed, which it has if it made it
            // to disk in this old format.
            free.or_assign(&dealloc);
            status.insert(ExtentStatus::NO_LEGACY_DEALLOC_MAP);
            status.remove(ExtentStatus::HAS_DEALLOCATED);
        }
        if free.len_bits() < self.length || free.len_bits() > capacity {
            return Err(invalid("free page map doesn't match extent length"));
        }
        if free.first_set_from(self.length).is_some() {
            return Err(invalid("free page map marks pages past the extent length"));
        }
        if free.first_set().is_some() {
            status.insert(ExtentStatus::HAS_FREE);
        }

        let mut unfilled = match self.unfilled {
            Some(map) => map,
            None => PageBitmap::new(free.len_bits()),
        };
        status.insert(ExtentStatus::KEEP_UNFILLED_MAP);
        unfilled.grow(free.len_bits());
        if unfilled.len_bits() > free.len_bits() {
            return Err(invalid("unfilled page map longer than free page map"));
        }

        let mut ext = Extent {
            offset: self.offset,
            first_page: self.start,
            max_last_page: self.end,
            allocated_length: self.length,
            preallocated_length: self.prealloc_length.max(self.length),
            status,
            free,
            unfilled: PageBitmap::default(),
        };
        ext.update_unfilled_page_info(unfilled);
        Ok(ext)
    }
}

pub(super) fn decode<R: io::Read>(r: &mut R) -> io::Result<Extent> {
    RawExtent::read(r)?.normalize()
}
