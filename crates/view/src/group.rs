//! Wallet groups: the two fixed buckets plus ad-hoc standalone groups.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use ledgerd_chainstate::manager::BlockDataManager;
use ledgerd_storage::KeyValueStore;

use crate::ledger::{sort_ledger, HistoryOrdering, LedgerEntry, LedgerKey};
use crate::pager::{HistoryPager, PagingOutcome, FORCE_REBUILD_ID};
use crate::wallet::{ScanWalletStruct, Wallet};
use crate::ViewError;

pub struct WalletGroup {
    wallets: RwLock<BTreeMap<String, Arc<RwLock<Wallet>>>>,
    /// Serializes full-page rebuilds across all the group's wallets.
    hist: Mutex<HistoryPager>,
    wlt_filter_set: Mutex<BTreeSet<String>>,
    order: HistoryOrdering,
}

impl WalletGroup {
    pub fn new(order: HistoryOrdering) -> Self {
        Self {
            wallets: RwLock::new(BTreeMap::new()),
            hist: Mutex::new(HistoryPager::new()),
            wlt_filter_set: Mutex::new(BTreeSet::new()),
            order,
        }
    }

    pub fn ordering(&self) -> HistoryOrdering {
        self.order
    }

    pub fn register_wallet(&self, wallet_id: &str) -> Arc<RwLock<Wallet>> {
        let mut wallets = self.wallets.write().expect("group lock");
        Arc::clone(
            wallets
                .entry(wallet_id.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Wallet::new(wallet_id)))),
        )
    }

    pub fn unregister_wallet(&self, wallet_id: &str) -> Option<Arc<RwLock<Wallet>>> {
        self.wallets.write().expect("group lock").remove(wallet_id)
    }

    pub fn has_id(&self, wallet_id: &str) -> bool {
        self.wallets
            .read()
            .expect("group lock")
            .contains_key(wallet_id)
    }

    pub fn wallet_by_id(&self, wallet_id: &str) -> Option<Arc<RwLock<Wallet>>> {
        self.wallets
            .read()
            .expect("group lock")
            .get(wallet_id)
            .cloned()
    }

    pub fn wallet_map(&self) -> BTreeMap<String, Arc<RwLock<Wallet>>> {
        self.wallets.read().expect("group lock").clone()
    }

    pub fn insert_wallet(&self, wallet: Arc<RwLock<Wallet>>) {
        let wallet_id = wallet.read().expect("wallet lock").wallet_id().to_string();
        self.wallets
            .write()
            .expect("group lock")
            .insert(wallet_id, wallet);
    }

    pub fn reset(&self) {
        for wallet in self.wallets.read().expect("group lock").values() {
            wallet.write().expect("wallet lock").reset();
        }
        self.hist.lock().expect("pager lock").reset();
    }

    fn visible_wallets(&self) -> Vec<Arc<RwLock<Wallet>>> {
        self.wallets
            .read()
            .expect("group lock")
            .values()
            .filter(|wallet| wallet.read().expect("wallet lock").ui_filter)
            .cloned()
            .collect()
    }

    fn compute_wallets_ssh_summary<S: KeyValueStore + 'static>(
        &self,
        manager: &BlockDataManager<S>,
    ) -> Result<BTreeMap<u32, u32>, ViewError> {
        let mut full_summary: BTreeMap<u32, u32> = BTreeMap::new();
        for wallet in self.visible_wallets() {
            let wallet = wallet.read().expect("wallet lock");
            for (height, count) in wallet.ssh_summary(manager)? {
                *full_summary.entry(height).or_insert(0) += count;
            }
        }
        Ok(full_summary)
    }

    /// Repage the group history. Returns `Repaged` when the page table was
    /// rebuilt (callers then restart their scan from the new first page).
    pub fn page_history<S: KeyValueStore + 'static>(
        &self,
        manager: &BlockDataManager<S>,
        force: bool,
    ) -> Result<PagingOutcome, ViewError> {
        let summary = self.compute_wallets_ssh_summary(manager)?;
        Ok(self
            .hist
            .lock()
            .expect("pager lock")
            .map_history(&summary, force))
    }

    pub fn page_count(&self) -> usize {
        self.hist.lock().expect("pager lock").page_count()
    }

    pub fn page_bottom(&self, page_id: u32) -> Option<u32> {
        self.hist.lock().expect("pager lock").page_bottom(page_id)
    }

    pub fn block_in_vicinity(&self, height: u32) -> Option<u32> {
        self.hist.lock().expect("pager lock").block_in_vicinity(height)
    }

    pub fn page_id_for_block_height(&self, height: u32) -> Option<u32> {
        self.hist
            .lock()
            .expect("pager lock")
            .page_id_for_block_height(height)
    }

    /// One page of the combined wallet history, memoized by update ID.
    pub fn get_history_page<S: KeyValueStore + 'static>(
        &self,
        manager: &BlockDataManager<S>,
        page_id: u32,
        update_id: u32,
        rebuild_ledger: bool,
        remap_wallets: bool,
    ) -> Result<Vec<LedgerEntry>, ViewError> {
        if rebuild_ledger || remap_wallets {
            self.page_history(manager, true)?;
        }

        let mut hist = self.hist.lock().expect("pager lock");
        if !hist.is_paged() {
            drop(hist);
            self.page_history(manager, false)?;
            hist = self.hist.lock().expect("pager lock");
        }
        if page_id as usize >= hist.page_count() {
            return Err(ViewError::PageOutOfRange);
        }
        let actual_page = match self.order {
            HistoryOrdering::Ascending => hist.page_count() as u32 - page_id - 1,
            HistoryOrdering::Descending => page_id,
        };

        let mut update_id = update_id;
        if rebuild_ledger || remap_wallets {
            update_id = FORCE_REBUILD_ID;
        }

        let visible = self.visible_wallets();
        {
            let local_filter: BTreeSet<String> = visible
                .iter()
                .map(|wallet| wallet.read().expect("wallet lock").wallet_id().to_string())
                .collect();
            let mut filter_set = self.wlt_filter_set.lock().expect("filter set lock");
            if *filter_set != local_filter {
                update_id = FORCE_REBUILD_ID;
                *filter_set = local_filter;
            }
        }

        let ledger_map = hist.page_ledger_map(actual_page, update_id, &mut |bottom, top| {
            let mut result: BTreeMap<LedgerKey, LedgerEntry> = BTreeMap::new();
            for wallet in &visible {
                let wallet = wallet.read().expect("wallet lock");
                let txios = wallet.txio_for_range(manager, bottom, top)?;
                result.extend(wallet.build_ledgers(manager, &txios, bottom, top)?);
            }
            Ok(result)
        })?;

        let mut entries: Vec<LedgerEntry> = ledger_map.values().cloned().collect();

        // Zero-conf entries ride on the newest page.
        if actual_page == 0 {
            for wallet in &visible {
                let wallet = wallet.read().expect("wallet lock");
                entries.extend(wallet.zc_ledgers().values().cloned());
            }
        }

        sort_ledger(&mut entries, self.order);
        Ok(entries)
    }

    /// Set which wallets are visible; returns whether the set changed (the
    /// caller then emits a filter-changed refresh).
    pub fn update_ledger_filter<S: KeyValueStore + 'static>(
        &self,
        manager: &BlockDataManager<S>,
        wallet_ids: &[String],
    ) -> Result<bool, ViewError> {
        let mut previously_enabled: Vec<String> = Vec::new();
        {
            let wallets = self.wallets.read().expect("group lock");
            for (wallet_id, wallet) in wallets.iter() {
                let mut wallet = wallet.write().expect("wallet lock");
                if wallet.ui_filter {
                    previously_enabled.push(wallet_id.clone());
                }
                wallet.ui_filter = false;
            }
            for wallet_id in wallet_ids {
                if let Some(wallet) = wallets.get(wallet_id) {
                    wallet.write().expect("wallet lock").ui_filter = true;
                }
            }
        }

        let mut requested = wallet_ids.to_vec();
        requested.sort();
        previously_enabled.sort();
        if requested == previously_enabled {
            return Ok(false);
        }

        self.page_history(manager, true)?;
        Ok(true)
    }

    /// Run one scan over every wallet; returns the union of fresh zero-conf
    /// ledger entries.
    pub fn scan_wallets<S: KeyValueStore + 'static>(
        &self,
        manager: &BlockDataManager<S>,
        scan: &ScanWalletStruct,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>, ViewError> {
        let mut zc_entries = BTreeMap::new();
        for wallet in self.wallets.read().expect("group lock").values() {
            let mut wallet = wallet.write().expect("wallet lock");
            zc_entries.extend(wallet.scan_wallet(manager, scan)?);
        }
        Ok(zc_entries)
    }
}
