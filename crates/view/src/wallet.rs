//! Wallets: registered script-address sets with ledger state.

use std::collections::{BTreeMap, BTreeSet};

use ledgerd_chainstate::keys::{TxKey, TxOutKey};
use ledgerd_chainstate::manager::BlockDataManager;
use ledgerd_chainstate::ssh::TxIOPair;
use ledgerd_primitives::{scr_addr_for_script, ScrAddr};
use ledgerd_storage::KeyValueStore;

use crate::ledger::{LedgerEntry, LedgerKey};
use crate::pager::{HistoryPager, PagingOutcome, FORCE_REBUILD_ID};
use crate::ViewError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanAction {
    Init,
    NewBlock,
    Zc,
    Refresh,
}

/// Everything one notification-driven scan hands each wallet.
#[derive(Clone, Debug)]
pub struct ScanWalletStruct {
    pub action: ScanAction,
    pub start_block: u32,
    pub end_block: u32,
    pub prev_top_block: u32,
    pub reorg: bool,
    pub zc_map: BTreeMap<ScrAddr, BTreeMap<TxOutKey, TxIOPair>>,
    pub new_zc_keys: BTreeSet<TxKey>,
    pub invalidated_zc_keys: BTreeSet<TxKey>,
    pub mined_txio_keys: BTreeSet<TxKey>,
    pub zc_tx_hashes: BTreeMap<TxKey, ledgerd_primitives::Hash256>,
}

impl ScanWalletStruct {
    pub fn new(action: ScanAction) -> Self {
        Self {
            action,
            start_block: 0,
            end_block: 0,
            prev_top_block: 0,
            reorg: false,
            zc_map: BTreeMap::new(),
            new_zc_keys: BTreeSet::new(),
            invalidated_zc_keys: BTreeSet::new(),
            mined_txio_keys: BTreeSet::new(),
            zc_tx_hashes: BTreeMap::new(),
        }
    }
}

/// One registered address plus its own history pages (the per-address
/// ledger delegate reads these).
pub struct ScrAddrObj {
    scr_addr: ScrAddr,
    pager: HistoryPager,
}

impl ScrAddrObj {
    pub fn new(scr_addr: ScrAddr) -> Self {
        Self {
            scr_addr,
            pager: HistoryPager::new(),
        }
    }

    pub fn scr_addr(&self) -> &ScrAddr {
        &self.scr_addr
    }

    pub fn map_pages<S: KeyValueStore + 'static>(
        &mut self,
        manager: &BlockDataManager<S>,
    ) -> Result<PagingOutcome, ViewError> {
        let summary = manager.ssh_height_summary(&self.scr_addr)?;
        Ok(self.pager.map_history(&summary, true))
    }

    pub fn page_count(&self) -> usize {
        self.pager.page_count()
    }

    pub fn get_history_page_by_id<S: KeyValueStore + 'static>(
        &mut self,
        manager: &BlockDataManager<S>,
        page_id: u32,
    ) -> Result<Vec<LedgerEntry>, ViewError> {
        if !self.pager.is_paged() {
            self.map_pages(manager)?;
        }
        let scr_addr = self.scr_addr;
        let ledger = self
            .pager
            .page_ledger_map(page_id, FORCE_REBUILD_ID, &mut |bottom, top| {
                let mut txios: BTreeMap<TxOutKey, TxIOPair> = BTreeMap::new();
                for txio in manager.txios_for_scr_addr(&scr_addr, bottom, top)? {
                    txios.insert(txio.txout_key, txio);
                }
                build_ledger_entries(manager, "", &txios, bottom, top, None)
            })?;
        Ok(ledger.values().cloned().collect())
    }

    pub fn block_in_vicinity<S: KeyValueStore + 'static>(
        &mut self,
        manager: &BlockDataManager<S>,
        height: u32,
    ) -> Result<u32, ViewError> {
        if !self.pager.is_paged() {
            self.map_pages(manager)?;
        }
        self.pager
            .block_in_vicinity(height)
            .ok_or(ViewError::PageOutOfRange)
    }

    pub fn page_id_for_block_height<S: KeyValueStore + 'static>(
        &mut self,
        manager: &BlockDataManager<S>,
        height: u32,
    ) -> Result<u32, ViewError> {
        if !self.pager.is_paged() {
            self.map_pages(manager)?;
        }
        self.pager
            .page_id_for_block_height(height)
            .ok_or(ViewError::PageOutOfRange)
    }
}

pub struct Wallet {
    wallet_id: String,
    scr_addr_map: BTreeMap<ScrAddr, ScrAddrObj>,
    pub ui_filter: bool,
    registered: bool,
    zc_ledgers: BTreeMap<LedgerKey, LedgerEntry>,
    valid_zc_keys: BTreeSet<TxKey>,
}

impl Wallet {
    pub fn new(wallet_id: impl Into<String>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            scr_addr_map: BTreeMap::new(),
            ui_filter: true,
            registered: false,
            zc_ledgers: BTreeMap::new(),
            valid_zc_keys: BTreeSet::new(),
        }
    }

    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn set_registered(&mut self) {
        self.registered = true;
    }

    pub fn has_scr_address(&self, scr_addr: &ScrAddr) -> bool {
        self.scr_addr_map.contains_key(scr_addr)
    }

    pub fn scr_addrs(&self) -> Vec<ScrAddr> {
        self.scr_addr_map.keys().copied().collect()
    }

    pub fn scr_addr_set(&self) -> BTreeSet<ScrAddr> {
        self.scr_addr_map.keys().copied().collect()
    }

    pub fn add_addresses(&mut self, scr_addrs: &[ScrAddr]) {
        for scr_addr in scr_addrs {
            self.scr_addr_map
                .entry(*scr_addr)
                .or_insert_with(|| ScrAddrObj::new(*scr_addr));
        }
    }

    pub fn remove_addresses(&mut self, scr_addrs: &[ScrAddr]) {
        for scr_addr in scr_addrs {
            self.scr_addr_map.remove(scr_addr);
        }
    }

    pub fn scr_addr_obj_mut(&mut self, scr_addr: &ScrAddr) -> Option<&mut ScrAddrObj> {
        self.scr_addr_map.get_mut(scr_addr)
    }

    pub fn zc_ledgers(&self) -> &BTreeMap<LedgerKey, LedgerEntry> {
        &self.zc_ledgers
    }

    pub fn reset(&mut self) {
        self.zc_ledgers.clear();
        self.valid_zc_keys.clear();
    }

    /// Per-height TxIO counts over all this wallet's addresses.
    pub fn ssh_summary<S: KeyValueStore + 'static>(
        &self,
        manager: &BlockDataManager<S>,
    ) -> Result<BTreeMap<u32, u32>, ViewError> {
        let mut summary: BTreeMap<u32, u32> = BTreeMap::new();
        for scr_addr in self.scr_addr_map.keys() {
            for (height, count) in manager.ssh_height_summary(scr_addr)? {
                *summary.entry(height).or_insert(0) += count;
            }
        }
        Ok(summary)
    }

    /// Confirmed TxIOs over the wallet's addresses in `[start, end]`,
    /// deduplicated by output key.
    pub fn txio_for_range<S: KeyValueStore + 'static>(
        &self,
        manager: &BlockDataManager<S>,
        start: u32,
        end: u32,
    ) -> Result<BTreeMap<TxOutKey, TxIOPair>, ViewError> {
        let mut txios: BTreeMap<TxOutKey, TxIOPair> = BTreeMap::new();
        for scr_addr in self.scr_addr_map.keys() {
            for txio in manager.txios_for_scr_addr(scr_addr, start, end)? {
                txios.insert(txio.txout_key, txio);
            }
        }
        Ok(txios)
    }

    pub fn build_ledgers<S: KeyValueStore + 'static>(
        &self,
        manager: &BlockDataManager<S>,
        txios: &BTreeMap<TxOutKey, TxIOPair>,
        start: u32,
        end: u32,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>, ViewError> {
        let owned = self.scr_addr_set();
        build_ledger_entries(manager, &self.wallet_id, txios, start, end, Some(&owned))
    }

    /// Apply one scan: purge invalidated zero-conf state and, when the scan
    /// carries a mempool snapshot, rebuild the zero-conf ledger from it.
    /// Returns the entries for newly seen zero-conf keys.
    pub fn scan_wallet<S: KeyValueStore + 'static>(
        &mut self,
        manager: &BlockDataManager<S>,
        scan: &ScanWalletStruct,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>, ViewError> {
        let mut purge: BTreeSet<TxKey> = scan.invalidated_zc_keys.clone();
        purge.extend(scan.mined_txio_keys.iter().copied());
        if !purge.is_empty() {
            self.valid_zc_keys.retain(|key| !purge.contains(key));
            self.zc_ledgers.retain(|key, _| {
                key.0 != u32::MAX || !purge.contains(&TxKey::zero_conf(key.1))
            });
        }

        if matches!(scan.action, ScanAction::Zc)
            || (matches!(scan.action, ScanAction::Refresh) && !scan.zc_map.is_empty())
        {
            return self.rebuild_zc_ledgers(manager, scan);
        }

        Ok(BTreeMap::new())
    }

    fn rebuild_zc_ledgers<S: KeyValueStore + 'static>(
        &mut self,
        _manager: &BlockDataManager<S>,
        scan: &ScanWalletStruct,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>, ViewError> {
        #[derive(Default)]
        struct Acc {
            credit: u64,
            debit: u64,
        }

        self.zc_ledgers.clear();
        self.valid_zc_keys.clear();

        let mut acc: BTreeMap<TxKey, Acc> = BTreeMap::new();
        for (scr_addr, txio_map) in &scan.zc_map {
            if !self.has_scr_address(scr_addr) {
                continue;
            }
            for txio in txio_map.values() {
                if txio.has_txout_zc() && txio.txout_key.is_zero_conf() {
                    acc.entry(txio.txout_key.tx_key()).or_default().credit += txio.value;
                }
                if txio.has_txin_zc() {
                    if let Some(txin_key) = txio.txin_key {
                        if txin_key.is_zero_conf() {
                            acc.entry(txin_key.tx_key()).or_default().debit += txio.value;
                        }
                    }
                }
            }
        }

        let mut fresh = BTreeMap::new();
        for (zc_key, sums) in acc {
            let Some(tx_hash) = scan.zc_tx_hashes.get(&zc_key) else {
                continue;
            };
            let entry = LedgerEntry {
                wallet_id: self.wallet_id.clone(),
                value: sums.credit as i64 - sums.debit as i64,
                block_height: u32::MAX,
                tx_index: zc_key.tx_index(),
                tx_hash: *tx_hash,
                tx_time: 0,
                is_coinbase: false,
                is_sent_to_self: false,
                is_change_back: false,
            };
            let key = entry.key();
            if scan.new_zc_keys.contains(&zc_key) {
                fresh.insert(key, entry.clone());
            }
            self.valid_zc_keys.insert(zc_key);
            self.zc_ledgers.insert(key, entry);
        }

        Ok(fresh)
    }
}

/// Turn a TxIO set into per-transaction ledger rows for `[start, end]`.
/// `owned` (when given) is the address set used to flag send-to-self
/// transactions.
pub fn build_ledger_entries<S: KeyValueStore + 'static>(
    manager: &BlockDataManager<S>,
    wallet_id: &str,
    txios: &BTreeMap<TxOutKey, TxIOPair>,
    start: u32,
    end: u32,
    owned: Option<&BTreeSet<ScrAddr>>,
) -> Result<BTreeMap<LedgerKey, LedgerEntry>, ViewError> {
    #[derive(Default)]
    struct Acc {
        credit: u64,
        debit: u64,
        coinbase: bool,
    }

    let mut acc: BTreeMap<TxKey, Acc> = BTreeMap::new();
    for txio in txios.values() {
        let out_tx = txio.txout_key.tx_key();
        if !out_tx.is_zero_conf() {
            let height = out_tx.height();
            if height >= start && height <= end {
                let entry = acc.entry(out_tx).or_default();
                entry.credit += txio.value;
                entry.coinbase |= txio.is_from_coinbase;
            }
        }
        if let Some(txin_key) = txio.txin_key {
            let in_tx = txin_key.tx_key();
            if !in_tx.is_zero_conf() {
                let height = in_tx.height();
                if height >= start && height <= end {
                    acc.entry(in_tx).or_default().debit += txio.value;
                }
            }
        }
    }

    let mut entries = BTreeMap::new();
    for (tx_key, sums) in acc {
        let Some((tx, txid)) = manager.tx_by_key(&tx_key)? else {
            continue;
        };
        let height = tx_key.height();
        let tx_time = manager.block_time_by_height(height).unwrap_or(0);
        let is_sent_to_self = sums.debit > 0
            && match owned {
                Some(set) => tx.vout.iter().all(|output| {
                    scr_addr_for_script(&output.script_pubkey)
                        .map(|scr_addr| set.contains(&scr_addr))
                        .unwrap_or(false)
                }),
                None => false,
            };
        let entry = LedgerEntry {
            wallet_id: wallet_id.to_string(),
            value: sums.credit as i64 - sums.debit as i64,
            block_height: height,
            tx_index: tx_key.tx_index(),
            tx_hash: txid,
            tx_time,
            is_coinbase: sums.coinbase && sums.debit == 0,
            is_sent_to_self,
            is_change_back: false,
        };
        entries.insert(entry.key(), entry);
    }
    Ok(entries)
}
