//! The write-ahead log seam.
//!
//! Every change to an allocation page that affects which pages exist goes through an
//! [`AllocationLog`]: the log assigns the change an instant and records it, then applies it to the
//! latched page. Redo and undo apply the same [`AllocAction`] again, so a page's bitmaps can always
//! be rebuilt from the log after a crash.

use std::fmt;

use crate::{
    alloc_page::AllocPage,
    error::Result,
    page::PageKey,
    store::AllocPageStore,
    INVALID_PAGE_NUMBER,
};

/// Position of a record in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogInstant(u64);

impl LogInstant {
    pub fn new(instant: u64) -> Self {
        Self(instant)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Page state as recorded in the log.
///
/// `Deallocated` is the state a page is in between being freed and the freeing transaction
/// committing. The bitmap has no separate state for it; it's applied as a free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocStatus {
    Allocated,
    Deallocated,
    Free,
}

/// A loggable change to an allocation page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocAction {
    /// Move a managed page from `old` to `new`.
    SetPageStatus {
        page: u64,
        new: AllocStatus,
        old: AllocStatus,
    },
    /// Point the allocation page at its successor in the chain.
    ChainAllocPage {
        next_page: u64,
        next_offset: u64,
        prev_next_page: u64,
        prev_next_offset: u64,
    },
}

fn apply_status(page: &mut AllocPage, instant: LogInstant, target: u64, status: AllocStatus) -> Result<()> {
    match status {
        AllocStatus::Allocated => page.allocate_page(instant, target),
        AllocStatus::Deallocated | AllocStatus::Free => page.deallocate_page(instant, target),
    }
}

impl AllocAction {
    /// Apply the change.
    pub fn redo(&self, page: &mut AllocPage, instant: LogInstant) -> Result<()> {
        match *self {
            Self::SetPageStatus { page: target, new, .. } => apply_status(page, instant, target, new),
            Self::ChainAllocPage {
                next_page,
                next_offset,
                ..
            } => {
                page.chain_to(instant, next_page, next_offset);
                Ok(())
            }
        }
    }

    /// Reverse the change.
    pub fn undo(&self, page: &mut AllocPage, instant: LogInstant) -> Result<()> {
        match *self {
            Self::SetPageStatus { page: target, old, .. } => apply_status(page, instant, target, old),
            Self::ChainAllocPage {
                prev_next_page,
                prev_next_offset,
                ..
            } => {
                page.chain_to(instant, prev_next_page, prev_next_offset);
                Ok(())
            }
        }
    }
}

/// Writes allocation changes ahead of applying them.
pub trait AllocationLog {
    /// Record `action` against `page`, then apply it. The record must be durable (or at least
    /// ordered) before anyone can observe the change.
    fn log_and_apply(&mut self, page: &mut AllocPage, action: AllocAction) -> Result<LogInstant>;

    /// Undo every change not yet committed, newest first. Allocation pages chained in by an undone
    /// change are dropped from `store`.
    fn rollback(&mut self, store: &dyn AllocPageStore) -> Result<()>;
}

impl<L: AllocationLog + ?Sized> AllocationLog for &mut L {
    fn log_and_apply(&mut self, page: &mut AllocPage, action: AllocAction) -> Result<LogInstant> {
        (**self).log_and_apply(page, action)
    }

    fn rollback(&mut self, store: &dyn AllocPageStore) -> Result<()> {
        (**self).rollback(store)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub instant: LogInstant,
    pub page: PageKey,
    pub action: AllocAction,
}

/// An in-memory log, for embedding without a real log and for exercising redo/undo.
#[derive(Debug, Default)]
pub struct MemoryLog {
    last: u64,
    records: Vec<LogRecord>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    fn next_instant(&mut self) -> LogInstant {
        self.last += 1;
        LogInstant(self.last)
    }

    /// Replay every record for `page` newer than the page's version. Returns how many were applied.
    pub fn redo(&self, page: &mut AllocPage) -> Result<usize> {
        let key = page.key();
        let mut applied = 0;
        for rec in self.records.iter().filter(|r| r.page == key) {
            if rec.instant.get() <= page.version() {
                continue;
            }
            rec.action.redo(page, rec.instant)?;
            applied += 1;
        }
        tracing::debug!(page = key.page_number, applied, "redo of allocation page complete");
        Ok(applied)
    }
}

impl AllocationLog for MemoryLog {
    fn log_and_apply(&mut self, page: &mut AllocPage, action: AllocAction) -> Result<LogInstant> {
        let instant = self.next_instant();
        action.redo(page, instant)?;
        tracing::trace!(page = page.page_number(), %instant, ?action, "logged allocation change");
        self.records.push(LogRecord {
            instant,
            page: page.key(),
            action,
        });
        Ok(instant)
    }

    /// Each page is latched exclusively only while its record is undone.
    fn rollback(&mut self, store: &dyn AllocPageStore) -> Result<()> {
        while let Some(rec) = self.records.pop() {
            let instant = self.next_instant();
            {
                let mut page = store.latch_exclusive(rec.page.page_number)?;
                rec.action.undo(&mut page, instant)?;
            }
            if let AllocAction::ChainAllocPage {
                next_page,
                prev_next_page,
                ..
            } = rec.action
            {
                if next_page != prev_next_page && next_page != INVALID_PAGE_NUMBER {
                    store.remove_alloc_page(next_page)?;
                    tracing::debug!(page = next_page, "dropped unchained allocation page");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SpaceOptions,
        extent::PageStatus,
        store::{AllocPageStore, MemPageStore},
    };

    fn page(number: u64) -> AllocPage {
        AllocPage::create(PageKey::new(1, number), &SpaceOptions::default(), 0).unwrap()
    }

    #[test]
    fn instants_increase_and_records_are_kept() {
        let mut log = MemoryLog::new();
        let mut alloc = page(0);
        let a = alloc.log_allocate(&mut log, 1).unwrap();
        let b = alloc.log_allocate(&mut log, 2).unwrap();
        assert!(a < b);
        assert_eq!(alloc.version(), b.get());
        assert_eq!(log.records().len(), 2);
        assert_eq!(
            log.records()[1].action,
            AllocAction::SetPageStatus {
                page: 2,
                new: AllocStatus::Allocated,
                old: AllocStatus::Free
            }
        );
        assert_eq!(b.to_string(), "@2");
    }

    #[test]
    fn failed_changes_are_not_recorded() {
        let mut log = MemoryLog::new();
        let mut alloc = page(0);
        assert!(alloc.log_allocate(&mut log, 0).is_err());
        assert!(log.records().is_empty());
        assert_eq!(alloc.version(), 0);
    }

    #[test]
    fn redo_skips_what_the_page_has_seen() {
        let mut log = MemoryLog::new();
        let mut live = page(0);
        for n in 1..=4 {
            live.log_allocate(&mut log, n).unwrap();
        }
        let mut stale = live.clone();
        live.log_deallocate(&mut log, 2).unwrap();
        live.log_chain(&mut log, 500, 500 * 4096).unwrap();

        assert_eq!(log.redo(&mut stale).unwrap(), 2);
        assert_eq!(stale, live);
        assert_eq!(log.redo(&mut stale).unwrap(), 0);

        // Records for other pages are ignored
        let mut other = page(500);
        assert_eq!(log.redo(&mut other).unwrap(), 0);
    }

    #[test]
    fn rollback_undoes_newest_first() {
        let store = MemPageStore::new();
        drop(store.create_alloc_page(page(0)).unwrap());
        drop(store.create_alloc_page(page(90)).unwrap());
        let mut log = MemoryLog::new();
        {
            let mut alloc = store.latch_exclusive(0).unwrap();
            for n in 1..=3 {
                alloc.log_allocate(&mut log, n).unwrap();
            }
            alloc.log_deallocate(&mut log, 2).unwrap();
            alloc.log_allocate(&mut log, 2).unwrap();
            alloc.log_chain(&mut log, 90, 90 * 4096).unwrap();
        }
        log.rollback(&store).unwrap();
        assert!(log.records().is_empty());
        // The page the undone chain pointed at is gone
        assert_eq!(store.page_numbers(), vec![0]);

        let alloc = store.latch_shared(0).unwrap();
        assert!(alloc.is_last());
        assert_eq!(alloc.extent().allocated_count(), 0);
        for n in 1..=3 {
            assert_eq!(alloc.page_status(n), PageStatus::Free);
        }
        assert!(alloc.version() > 6);
    }
}
