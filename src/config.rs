use crate::{error::Result, page::check_page_size};

/// Options controlling how allocation pages are laid out and maintained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceOptions {
    /// Size of every page in the container, in bytes.
    pub page_size: usize,
    /// Run the extra consistency checks (chain cross-checks on cache revalidation, per-extent
    /// count checks). Has no effect in release builds.
    pub strict: bool,
    /// Don't preallocate pages until an allocation page has reserved at least this many.
    pub preallocate_threshold: u64,
    /// How many pages to preallocate at once.
    pub preallocate_batch: u32,
    /// Lower the number of pages a single allocation page manages. Lets tests build long chains
    /// of allocation pages without allocating thousands of pages.
    pub extent_capacity_limit: Option<u32>,
}

impl Default for SpaceOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            strict: cfg!(debug_assertions),
            preallocate_threshold: 8,
            preallocate_batch: 8,
            extent_capacity_limit: None,
        }
    }
}

impl SpaceOptions {
    /// Set the container page size.
    pub fn page_size(&mut self, page_size: usize) -> &mut Self {
        self.page_size = page_size;
        self
    }

    /// Enable or disable strict checking.
    pub fn strict(&mut self, strict: bool) -> &mut Self {
        self.strict = strict;
        self
    }

    /// Set when preallocation starts and how many pages it reserves each time.
    pub fn preallocate(&mut self, threshold: u64, batch: u32) -> &mut Self {
        self.preallocate_threshold = threshold;
        self.preallocate_batch = batch;
        self
    }

    /// Cap how many pages a single allocation page manages.
    pub fn extent_capacity_limit(&mut self, limit: u32) -> &mut Self {
        self.extent_capacity_limit = Some(limit);
        self
    }

    /// Whether strict checks should run. Always false in release builds.
    #[inline]
    pub fn is_strict(&self) -> bool {
        cfg!(debug_assertions) && self.strict
    }

    pub fn validate(&self) -> Result<()> {
        check_page_size(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let mut opts = SpaceOptions::default();
        opts.page_size(8192).strict(true).preallocate(4, 16).extent_capacity_limit(3);
        assert_eq!(opts.page_size, 8192);
        assert_eq!(opts.preallocate_threshold, 4);
        assert_eq!(opts.preallocate_batch, 16);
        assert_eq!(opts.extent_capacity_limit, Some(3));
        assert_eq!(opts.is_strict(), cfg!(debug_assertions));
        assert!(opts.validate().is_ok());
        assert!(opts.page_size(100).validate().is_err());
    }
}
