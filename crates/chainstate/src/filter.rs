//! The registered script-address set and side-scan bookkeeping.
//!
//! The live filter gates which outputs the block writer indexes. Batches of
//! addresses registered after first activity are back-filled by a side scan
//! on a worker thread; the finished rows wait in a merge pile that the
//! ingest loop folds in through `check_for_merge` before applying any new
//! block.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use crossbeam_channel::{Receiver, Sender};
use ledgerd_primitives::ScrAddr;
use ledgerd_storage::{delete_prefix_batched, Column, KeyValueStore, WriteBatch};

use crate::ChainError;

const WIPE_DELETE_CAP: usize = 10_000;

/// The seam the block writer sees: is this address worth indexing.
pub trait AddressFilter: Send + Sync {
    fn contains(&self, scr_addr: &ScrAddr) -> bool;
}

/// Super-node mode tracks every address.
pub struct MatchAll;

impl AddressFilter for MatchAll {
    fn contains(&self, _scr_addr: &ScrAddr) -> bool {
        true
    }
}

/// A cloned filter holding only the addresses of one side scan.
pub struct ScanSubset {
    set: HashSet<ScrAddr>,
}

impl ScanSubset {
    pub fn new(addrs: impl IntoIterator<Item = ScrAddr>) -> Self {
        Self {
            set: addrs.into_iter().collect(),
        }
    }
}

impl AddressFilter for ScanSubset {
    fn contains(&self, scr_addr: &ScrAddr) -> bool {
        self.set.contains(scr_addr)
    }
}

/// A batch of addresses registered on behalf of one wallet.
#[derive(Clone, Debug)]
pub struct WalletBatch {
    pub wallet_id: String,
    pub scr_addrs: Vec<ScrAddr>,
    pub is_new: bool,
}

/// Completion side of a registration; `true` means the caller should
/// refresh its view.
pub struct RegistrationHandle {
    receiver: Receiver<bool>,
}

impl RegistrationHandle {
    pub fn new(receiver: Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// Block until the registration (and any side scan) completed.
    pub fn wait(&self) -> bool {
        self.receiver.recv().unwrap_or(false)
    }

    pub fn try_done(&self) -> Option<bool> {
        self.receiver.try_recv().ok()
    }
}

pub(crate) struct PendingMerge {
    pub addrs: HashMap<ScrAddr, u32>,
    pub scanned_to: u32,
    pub wallet_id: String,
    pub done: Sender<bool>,
}

pub struct ScrAddrFilter {
    super_node: bool,
    registered: RwLock<HashMap<ScrAddr, u32>>,
    pending_merges: Mutex<Vec<PendingMerge>>,
    merge_flag: AtomicBool,
}

impl ScrAddrFilter {
    pub fn new(super_node: bool) -> Self {
        Self {
            super_node,
            registered: RwLock::new(HashMap::new()),
            pending_merges: Mutex::new(Vec::new()),
            merge_flag: AtomicBool::new(false),
        }
    }

    pub fn is_super_node(&self) -> bool {
        self.super_node
    }

    pub fn num_scr_addrs(&self) -> usize {
        self.registered.read().expect("filter lock").len()
    }

    pub fn is_registered(&self, scr_addr: &ScrAddr) -> bool {
        self.registered
            .read()
            .expect("filter lock")
            .contains_key(scr_addr)
    }

    pub fn first_scan_height(&self, scr_addr: &ScrAddr) -> Option<u32> {
        self.registered
            .read()
            .expect("filter lock")
            .get(scr_addr)
            .copied()
    }

    /// Lowest first-scan height across the registered set.
    pub fn scan_from(&self) -> Option<u32> {
        self.registered
            .read()
            .expect("filter lock")
            .values()
            .min()
            .copied()
    }

    pub fn snapshot(&self) -> HashMap<ScrAddr, u32> {
        self.registered.read().expect("filter lock").clone()
    }

    pub fn insert_batch(&self, addrs: impl IntoIterator<Item = (ScrAddr, u32)>) {
        let mut registered = self.registered.write().expect("filter lock");
        for (scr_addr, height) in addrs {
            registered.entry(scr_addr).or_insert(height);
        }
    }

    pub fn remove(&self, addrs: &[ScrAddr]) {
        let mut registered = self.registered.write().expect("filter lock");
        for scr_addr in addrs {
            registered.remove(scr_addr);
        }
    }

    pub fn clear(&self) {
        self.registered.write().expect("filter lock").clear();
    }

    /// Reset every first-scan height to zero; used when histories were
    /// dropped and everything rescans from genesis.
    pub fn reset_scan_heights(&self) {
        let mut registered = self.registered.write().expect("filter lock");
        for height in registered.values_mut() {
            *height = 0;
        }
    }

    pub(crate) fn queue_merge(&self, merge: PendingMerge) {
        self.pending_merges
            .lock()
            .expect("merge pile lock")
            .push(merge);
        self.merge_flag.store(true, Ordering::Release);
    }

    pub fn has_pending_merge(&self) -> bool {
        self.merge_flag.load(Ordering::Acquire)
    }

    pub(crate) fn take_pending_merges(&self) -> Vec<PendingMerge> {
        let mut pile = self.pending_merges.lock().expect("merge pile lock");
        self.merge_flag.store(false, Ordering::Release);
        std::mem::take(&mut *pile)
    }

    /// Drop the SSH rows of the given addresses and unregister them.
    pub fn wipe<S: KeyValueStore>(
        &self,
        store: &S,
        addrs: &[ScrAddr],
    ) -> Result<usize, ChainError> {
        let mut deleted = 0usize;
        let mut batch = WriteBatch::new();
        for scr_addr in addrs {
            batch.delete(Column::ScriptHist, scr_addr.as_bytes());
            deleted += delete_prefix_batched(
                store,
                Column::SubHist,
                scr_addr.as_bytes(),
                WIPE_DELETE_CAP,
            )?;
        }
        store.write_batch(&batch)?;
        self.remove(addrs);
        Ok(deleted)
    }
}

impl AddressFilter for ScrAddrFilter {
    fn contains(&self, scr_addr: &ScrAddr) -> bool {
        if self.super_node {
            return true;
        }
        self.registered
            .read()
            .expect("filter lock")
            .contains_key(scr_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_primitives::script::ScrAddr;

    fn addr(tag: u8) -> ScrAddr {
        ScrAddr::new(0x00, [tag; 20])
    }

    #[test]
    fn super_node_contains_everything() {
        let filter = ScrAddrFilter::new(true);
        assert!(filter.contains(&addr(1)));
        assert!(!filter.is_registered(&addr(1)));
    }

    #[test]
    fn registration_is_idempotent_and_keeps_first_height() {
        let filter = ScrAddrFilter::new(false);
        filter.insert_batch([(addr(1), 10)]);
        filter.insert_batch([(addr(1), 99)]);
        assert_eq!(filter.first_scan_height(&addr(1)), Some(10));
        assert_eq!(filter.num_scr_addrs(), 1);
    }

    #[test]
    fn scan_from_is_minimum_height() {
        let filter = ScrAddrFilter::new(false);
        filter.insert_batch([(addr(1), 10), (addr(2), 4)]);
        assert_eq!(filter.scan_from(), Some(4));
    }
}
