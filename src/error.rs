use thiserror::Error;

/// Errors produced by the allocation engine.
///
/// Invariant violations (freeing a free page, reusing an allocated one) are not represented here:
/// they are logic bugs and panic instead of returning.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpaceError {
    /// On-disk allocation data can't be trusted. The page layer should mark the container corrupt
    /// and refuse further use until recovery.
    #[error("Allocation page {page} is corrupt: {reason}")]
    Corruption { page: u64, reason: &'static str },
    /// A page number outside of the range an extent manages was used
    #[error("Page {page} is outside of the managed page range")]
    PageOutOfRange { page: u64 },
    /// The configured page size can't hold a useful allocation page
    #[error("Page size of {page_size} bytes can't hold an allocation page")]
    PageTooSmall { page_size: usize },
    /// Borrowed container info doesn't fit in the borrowed space
    #[error("Container info of {len} bytes exceeds the maximum of {max} bytes")]
    ContainerInfoTooLarge { len: usize, max: usize },
    /// The borrowed space length is fixed once an allocation page is created
    #[error("Container info length changed from {old} to {new} bytes")]
    ContainerInfoChanged { old: usize, new: usize },
    /// The page store doesn't hold the requested allocation page
    #[error("Allocation page {page} was not found")]
    NotFound { page: u64 },
    /// An allocation page with this number is already in the page store
    #[error("Allocation page {page} already exists")]
    PageExists { page: u64 },
    /// Couldn't open or access the backing container file
    #[error("Accessing the container file failed")]
    Io(#[from] std::io::Error),
    /// Couldn't lock the backing container file
    #[error("Failed to lock the container file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't resize the backing container file
    #[error("Can't resize the container file. Have 0x{size:x} bytes, wanted 0x{requested:x} bytes")]
    Resize {
        size: u64,
        requested: u64,
        source: std::io::Error,
    },
    /// Couldn't memory map the backing container file
    #[error("Memory mapping 0x{len:x} bytes of the container file failed")]
    Map { len: u64, source: std::io::Error },
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(&'static str),
}

impl SpaceError {
    /// Whether the error means the container's allocation data is corrupt.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }

    pub(crate) fn corrupt(page: u64, reason: &'static str) -> Self {
        tracing::error!(page, reason, "allocation page corruption detected");
        Self::Corruption { page, reason }
    }
}

pub type Result<T> = std::result::Result<T, SpaceError>;
