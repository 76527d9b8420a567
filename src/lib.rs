/*!
Free space tracking and page allocation for a transactional page store.

Every container (a file of fixed-size pages) keeps a chain of allocation pages. Each one embeds an
[`Extent`]: a pair of bitmaps over the pages right after it, recording which of them are free and
which are allocated but have room left ("unfilled"). When the last extent in the chain fills up, a
new allocation page is created just past it and chained in.

Changes to allocation pages only happen through an [`AllocationLog`], which records them ahead of
applying them. The [`AllocationCache`] indexes the chain in memory so finding the allocation page
for a page number doesn't mean walking the chain; it can always be dropped and rebuilt.

[`ContainerSpace`] ties these together for one container:

```no_run
use crab_db_extent::{ContainerSpace, MemPageStore, MemoryLog, SpaceOptions};

let store = MemPageStore::new();
let space = ContainerSpace::create(&store, &store, MemoryLog::new(), SpaceOptions::default(), 1, b"")?;
let page = space.add_page()?;
space.track_unfilled(page, true);
space.remove_page(page)?;
# Ok::<(), crab_db_extent::SpaceError>(())
```
*/

pub mod alloc_page;
pub mod bitmap;
pub mod cache;
mod config;
mod error;
pub mod extent;
pub mod log;
pub mod page;
mod space;
pub mod storage;
pub mod store;

pub use alloc_page::AllocPage;
pub use bitmap::PageBitmap;
pub use cache::{AllocationCache, SpaceInfo};
pub use config::SpaceOptions;
pub use error::{Result, SpaceError};
pub use extent::{Extent, ExtentStatus, PageStatus};
pub use log::{AllocAction, AllocStatus, AllocationLog, LogInstant, MemoryLog};
pub use page::PageKey;
pub use space::ContainerSpace;
pub use storage::ContainerFile;
pub use store::{AllocPageStore, ExclusiveLatch, MemPageStore, PagePreallocator, SharedLatch};

/// Marks the end of the allocation page chain.
pub const INVALID_PAGE_NUMBER: u64 = u64::MAX;

/// Page number of the first allocation page in every container.
pub const FIRST_ALLOC_PAGE_NUMBER: u64 = 0;
