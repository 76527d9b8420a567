//! The generic page frame every allocation page sits in.
//!
//! This is the minimal slice of the page layer the allocation engine needs: a fixed header naming
//! the page, and an xxh3 checksum over everything else in the trailing 8 bytes.

use crate::error::{Result, SpaceError};

/// Format identifier of an allocation page.
pub const ALLOC_PAGE_FORMAT_ID: u32 = 118;

/// Length of the generic header, format identifier included.
pub const PAGE_HEADER_LEN: usize = std::mem::size_of::<PageHeader>();

/// Length of the checksum trailer.
pub const CHECKSUM_LEN: usize = 8;

pub const MIN_PAGE_SIZE: usize = 1 << 10;
pub const MAX_PAGE_SIZE: usize = 1 << 15;

/// Identity of a page within the page store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub container: u64,
    pub page_number: u64,
}

impl PageKey {
    pub fn new(container: u64, page_number: u64) -> Self {
        Self {
            container,
            page_number,
        }
    }
}

/// On-disk page header. All fields big-endian.
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct PageHeader {
    format_id: [u8; 4],
    flags: [u8; 4],
    version: [u8; 8],
    page_number: [u8; 8],
    container: [u8; 8],
    _reserved: [u8; 28],
}

/// The parts of a page header the allocation engine cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFrame {
    pub format_id: u32,
    pub key: PageKey,
    /// Instant of the last log record applied to the page.
    pub version: u64,
}

impl PageFrame {
    /// Write the frame into the start of a page.
    ///
    /// # Panics
    ///
    /// Panics if the page is shorter than the header.
    pub fn write(&self, page: &mut [u8]) {
        let header = PageHeader {
            format_id: self.format_id.to_be_bytes(),
            flags: [0; 4],
            version: self.version.to_be_bytes(),
            page_number: self.key.page_number.to_be_bytes(),
            container: self.key.container.to_be_bytes(),
            _reserved: [0; 28],
        };
        page[..PAGE_HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));
    }

    /// Read the frame from the start of a page.
    pub fn read(page: &[u8]) -> Option<Self> {
        let raw = page.get(..PAGE_HEADER_LEN)?;
        let header: PageHeader = bytemuck::pod_read_unaligned(raw);
        Some(Self {
            format_id: u32::from_be_bytes(header.format_id),
            key: PageKey {
                container: u64::from_be_bytes(header.container),
                page_number: u64::from_be_bytes(header.page_number),
            },
            version: u64::from_be_bytes(header.version),
        })
    }
}

/// Check a page size is one the page layer supports.
pub fn check_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(SpaceError::Config("page size must be a power of two between 1 KiB and 32 KiB"));
    }
    Ok(())
}

fn checksum(body: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(body)
}

/// Write the checksum trailer over the rest of the page.
pub fn seal(page: &mut [u8]) {
    let split = page.len() - CHECKSUM_LEN;
    let (body, trailer) = page.split_at_mut(split);
    trailer.copy_from_slice(&checksum(body).to_be_bytes());
}

/// Check the checksum trailer against the rest of the page.
pub fn verify(page: &[u8]) -> bool {
    let Some(split) = page.len().checked_sub(CHECKSUM_LEN) else {
        return false;
    };
    let (body, trailer) = page.split_at(split);
    trailer == checksum(body).to_be_bytes()
}
