use std::{fs::File, path::Path};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::{
    error::{Result, SpaceError},
    page::check_page_size,
    store::PagePreallocator,
};

/// A container file: fixed-size pages in one exclusively locked, memory mapped file.
///
/// The file only ever grows. Growth is rounded up to whole system pages, so the map can always be
/// extended in place where the OS allows it.
#[derive(Debug)]
pub struct ContainerFile {
    page_size: usize,
    inner: Mutex<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    file: File,
    /// `None` while the file is empty.
    map: Option<MmapMut>,
    len: u64,
}

impl FileInner {
    fn map(file: &File, len: u64) -> Result<MmapMut> {
        // Safety: the file is exclusively locked for as long as the map exists, so nobody else
        // changes it underneath us.
        unsafe { MmapOptions::new().len(len as usize).map_mut(file) }
            .map_err(|source| SpaceError::Map { len, source })
    }

    /// Make the file at least `len` bytes long.
    fn grow(&mut self, len: u64, granularity: u64) -> Result<()> {
        if len <= self.len {
            return Ok(());
        }
        let new_len = len.div_ceil(granularity) * granularity;
        self.file.set_len(new_len).map_err(|source| SpaceError::Resize {
            size: self.len,
            requested: new_len,
            source,
        })?;
        // Update the metadata in order to get the new file size stored
        self.file.sync_all()?;

        // On Linux, we might be able to just expand the existing map
        #[cfg(target_os = "linux")]
        {
            if let Some(map) = self.map.as_mut() {
                // Safety: nothing borrows the map across this call; all access goes through `self`.
                let options = memmap2::RemapOptions::new().may_move(true);
                if unsafe { map.remap(new_len as usize, options) }.is_ok() {
                    self.len = new_len;
                    return Ok(());
                }
            }
        }

        if let Some(old) = self.map.take() {
            old.flush()?;
        }
        self.map = Some(Self::map(&self.file, new_len)?);
        self.len = new_len;
        Ok(())
    }
}

impl ContainerFile {
    /// Open or create a container file, taking an exclusive lock on it.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        use fs4::fs_std::FileExt;

        check_page_size(page_size)?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive().map_err(SpaceError::Lock)?;

        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(SpaceError::corrupt(0, "container file isn't a whole number of pages"));
        }
        let map = if len > 0 {
            Some(FileInner::map(&file, len)?)
        } else {
            None
        };
        tracing::debug!(len, page_size, "opened container file");
        Ok(Self {
            page_size,
            inner: Mutex::new(FileInner { file, map, len }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages the file currently holds, preallocated ones included.
    pub fn page_count(&self) -> u64 {
        self.inner.lock().len / self.page_size as u64
    }

    fn granularity(&self) -> u64 {
        self.page_size.max(page_size::get()) as u64
    }

    fn range(&self, page: u64) -> std::ops::Range<usize> {
        let start = page as usize * self.page_size;
        start..start + self.page_size
    }

    /// Copy a page image out of the file.
    pub fn read_page(&self, page: u64, image: &mut [u8]) -> Result<()> {
        assert_eq!(image.len(), self.page_size, "page image has the wrong size");
        let inner = self.inner.lock();
        if (page + 1) * self.page_size as u64 > inner.len {
            return Err(SpaceError::NotFound { page });
        }
        let Some(map) = inner.map.as_ref() else {
            return Err(SpaceError::NotFound { page });
        };
        image.copy_from_slice(&map[self.range(page)]);
        Ok(())
    }

    /// Copy a page image into the file, growing it if needed.
    pub fn write_page(&self, page: u64, image: &[u8]) -> Result<()> {
        assert_eq!(image.len(), self.page_size, "page image has the wrong size");
        let granularity = self.granularity();
        let mut inner = self.inner.lock();
        inner.grow((page + 1) * self.page_size as u64, granularity)?;
        let range = self.range(page);
        let map = inner.map.as_mut().ok_or(SpaceError::NotFound { page })?;
        map[range].copy_from_slice(image);
        Ok(())
    }

    /// Flush every written page to disk.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(map) = inner.map.as_ref() {
            map.flush()?;
        }
        Ok(())
    }
}

impl PagePreallocator for ContainerFile {
    fn preallocate_pages(&self, last_page: u64, count: u32) -> Result<u32> {
        let granularity = self.granularity();
        let end = (last_page + 1 + u64::from(count)) * self.page_size as u64;
        self.inner.lock().grow(end, granularity)?;
        Ok(count)
    }
}
