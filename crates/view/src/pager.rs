//! The history pager: fixed-size pages over a height-bucketed summary.

use std::collections::BTreeMap;

use crate::ledger::{LedgerEntry, LedgerKey};
use crate::ViewError;

pub const TXNS_PER_PAGE: u32 = 100;

/// Forces a page rebuild regardless of the memoized update ID.
pub const FORCE_REBUILD_ID: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PagingOutcome {
    AlreadyPaged,
    Repaged,
}

#[derive(Clone, Debug)]
struct Page {
    top: u32,
    bottom: u32,
    count: u32,
    update_id: u32,
    ledger: BTreeMap<LedgerKey, LedgerEntry>,
}

/// Partitions the union of visible SSH rows into pages of roughly
/// `TXNS_PER_PAGE` TxIO rows, ordered newest page first. Page ledger maps
/// are memoized by update ID.
#[derive(Default)]
pub struct HistoryPager {
    pages: Vec<Page>,
    paged: bool,
}

impl HistoryPager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paged(&self) -> bool {
        self.paged
    }

    pub fn reset(&mut self) {
        self.pages.clear();
        self.paged = false;
    }

    /// Rebuild the page table from a height → TxIO-count summary. Without
    /// `force`, an already-paged pager reports `AlreadyPaged` and keeps its
    /// table.
    pub fn map_history(&mut self, summary: &BTreeMap<u32, u32>, force: bool) -> PagingOutcome {
        if self.paged && !force {
            return PagingOutcome::AlreadyPaged;
        }

        self.pages.clear();
        let mut current: Option<Page> = None;
        for (&height, &count) in summary.iter().rev() {
            let page = current.get_or_insert_with(|| Page {
                top: height,
                bottom: height,
                count: 0,
                update_id: FORCE_REBUILD_ID,
                ledger: BTreeMap::new(),
            });
            page.bottom = height;
            page.count += count;
            if page.count >= TXNS_PER_PAGE {
                self.pages.push(current.take().expect("current page"));
            }
        }
        if let Some(page) = current {
            self.pages.push(page);
        }
        if self.pages.is_empty() {
            self.pages.push(Page {
                top: 0,
                bottom: 0,
                count: 0,
                update_id: FORCE_REBUILD_ID,
                ledger: BTreeMap::new(),
            });
        }
        // Every height below the oldest summarized block belongs to the
        // last page.
        self.pages.last_mut().expect("at least one page").bottom = 0;
        self.paged = true;
        PagingOutcome::Repaged
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_top(&self, page_id: u32) -> Option<u32> {
        self.pages.get(page_id as usize).map(|page| page.top)
    }

    pub fn page_bottom(&self, page_id: u32) -> Option<u32> {
        self.pages.get(page_id as usize).map(|page| page.bottom)
    }

    /// The top of the page containing `height`; clamps above the newest
    /// page.
    pub fn block_in_vicinity(&self, height: u32) -> Option<u32> {
        let first = self.pages.first()?;
        if height >= first.top {
            return Some(first.top);
        }
        self.page_id_for_block_height(height)
            .and_then(|page_id| self.page_top(page_id))
    }

    pub fn page_id_for_block_height(&self, height: u32) -> Option<u32> {
        for (index, page) in self.pages.iter().enumerate() {
            if height >= page.bottom {
                return Some(index as u32);
            }
        }
        Some(self.pages.len().saturating_sub(1) as u32)
    }

    /// The memoized ledger map of one page. The builder receives the
    /// page's `(bottom, top)` height range and runs only when the stored
    /// update ID differs (or `FORCE_REBUILD_ID` is passed).
    pub fn page_ledger_map(
        &mut self,
        page_id: u32,
        update_id: u32,
        build: &mut dyn FnMut(u32, u32) -> Result<BTreeMap<LedgerKey, LedgerEntry>, ViewError>,
    ) -> Result<&BTreeMap<LedgerKey, LedgerEntry>, ViewError> {
        let page = self
            .pages
            .get_mut(page_id as usize)
            .ok_or(ViewError::PageOutOfRange)?;
        if update_id != FORCE_REBUILD_ID && page.update_id == update_id {
            return Ok(&page.ledger);
        }
        // The newest page stays open-ended: blocks arriving after the last
        // repage still land on it.
        let top = if page_id == 0 { u32::MAX - 1 } else { page.top };
        page.ledger = build(page.bottom, top)?;
        page.update_id = update_id;
        Ok(&page.ledger)
    }
}
