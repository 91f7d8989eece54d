//! The viewer façade: wallet registration, the notification-driven scan
//! protocol, ledger delegates and the balance/UTXO query surface.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use ledgerd_chainstate::filter::WalletBatch;
use ledgerd_chainstate::manager::BlockDataManager;
use ledgerd_chainstate::stxo::UnspentTxOut;
use ledgerd_primitives::{Hash256, ScrAddr, Transaction};
use ledgerd_storage::KeyValueStore;

use crate::group::WalletGroup;
use crate::ledger::{HistoryOrdering, LedgerEntry, LedgerKey};
use crate::notify::{Notification, NotificationBus, RefreshScope};
use crate::pager::PagingOutcome;
use crate::wallet::{ScanAction, ScanWalletStruct, Wallet};
use crate::zeroconf::{ZcPacket, ZeroConfSource};
use crate::ViewError;

pub const GROUP_WALLET: usize = 0;
pub const GROUP_LOCKBOX: usize = 1;

/// The paging triple handed to external query layers.
pub struct LedgerDelegate {
    get_page: Box<dyn Fn(u32) -> Result<Vec<LedgerEntry>, ViewError> + Send + Sync>,
    get_block_in_vicinity: Box<dyn Fn(u32) -> Result<u32, ViewError> + Send + Sync>,
    get_page_id_for_height: Box<dyn Fn(u32) -> Result<u32, ViewError> + Send + Sync>,
}

impl LedgerDelegate {
    pub fn get_page(&self, page_id: u32) -> Result<Vec<LedgerEntry>, ViewError> {
        (self.get_page)(page_id)
    }

    pub fn get_block_in_vicinity(&self, height: u32) -> Result<u32, ViewError> {
        (self.get_block_in_vicinity)(height)
    }

    pub fn get_page_id_for_block_height(&self, height: u32) -> Result<u32, ViewError> {
        (self.get_page_id_for_height)(height)
    }
}

pub struct BlockDataViewer<S, Z> {
    manager: Arc<BlockDataManager<S>>,
    zeroconf: Arc<Z>,
    groups: Vec<Arc<WalletGroup>>,
    update_id: Arc<AtomicU32>,
    last_scanned: AtomicU32,
    bus: Arc<NotificationBus>,
}

impl<S: KeyValueStore + 'static, Z: ZeroConfSource + 'static> BlockDataViewer<S, Z> {
    pub fn new(manager: Arc<BlockDataManager<S>>, zeroconf: Arc<Z>) -> Self {
        Self {
            manager,
            zeroconf,
            groups: vec![
                Arc::new(WalletGroup::new(HistoryOrdering::Descending)),
                Arc::new(WalletGroup::new(HistoryOrdering::Descending)),
            ],
            update_id: Arc::new(AtomicU32::new(0)),
            last_scanned: AtomicU32::new(0),
            bus: Arc::new(NotificationBus::new()),
        }
    }

    pub fn manager(&self) -> &Arc<BlockDataManager<S>> {
        &self.manager
    }

    pub fn zeroconf(&self) -> &Arc<Z> {
        &self.zeroconf
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn update_id(&self) -> u32 {
        self.update_id.load(Ordering::Acquire)
    }

    pub fn last_scanned(&self) -> u32 {
        self.last_scanned.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Registration

    pub fn register_wallet(
        &self,
        scr_addrs: Vec<ScrAddr>,
        wallet_id: &str,
        is_new: bool,
    ) -> Result<bool, ViewError> {
        if wallet_id.is_empty() {
            return Ok(true);
        }
        self.register_with_group(GROUP_WALLET, scr_addrs, wallet_id, is_new)
    }

    pub fn register_lockbox(
        &self,
        scr_addrs: Vec<ScrAddr>,
        wallet_id: &str,
        is_new: bool,
    ) -> Result<bool, ViewError> {
        if wallet_id.is_empty() {
            return Ok(true);
        }
        self.register_with_group(GROUP_LOCKBOX, scr_addrs, wallet_id, is_new)
    }

    pub fn unregister_wallet(&self, wallet_id: &str) {
        self.groups[GROUP_WALLET].unregister_wallet(wallet_id);
    }

    pub fn unregister_lockbox(&self, wallet_id: &str) {
        self.groups[GROUP_LOCKBOX].unregister_wallet(wallet_id);
    }

    pub fn has_wallet(&self, wallet_id: &str) -> bool {
        self.groups[GROUP_WALLET].has_id(wallet_id)
    }

    /// Add addresses to whichever group holds the wallet. Returns `true`
    /// when the addresses went live immediately, `false` when a side scan
    /// is pending (a refresh notification follows on completion).
    pub fn register_addresses(
        &self,
        scr_addrs: Vec<ScrAddr>,
        wallet_id: &str,
        are_new: bool,
    ) -> Result<bool, ViewError> {
        if scr_addrs.is_empty() {
            return Ok(false);
        }
        for group_index in [GROUP_WALLET, GROUP_LOCKBOX] {
            if self.groups[group_index].has_id(wallet_id) {
                return self.register_with_group(group_index, scr_addrs, wallet_id, are_new);
            }
        }
        Ok(false)
    }

    fn register_with_group(
        &self,
        group_index: usize,
        scr_addrs: Vec<ScrAddr>,
        wallet_id: &str,
        is_new: bool,
    ) -> Result<bool, ViewError> {
        let group = &self.groups[group_index];
        let wallet = group.register_wallet(wallet_id);
        wallet
            .write()
            .expect("wallet lock")
            .add_addresses(&scr_addrs);

        let handle = Arc::clone(&self.manager).register_addresses(WalletBatch {
            wallet_id: wallet_id.to_string(),
            scr_addrs: scr_addrs.clone(),
            is_new,
        })?;

        if let Some(done) = handle.try_done() {
            if done {
                wallet.write().expect("wallet lock").set_registered();
                let zc = zc_packet_for(&*self.zeroconf, &scr_addrs);
                self.flag_refresh(
                    RefreshScope::AndRescan,
                    Some(wallet_id.to_string()),
                    Some(zc),
                );
            }
            return Ok(true);
        }

        // Side scan in flight; fire the refresh when it lands.
        let bus = Arc::clone(&self.bus);
        let zeroconf = Arc::clone(&self.zeroconf);
        let wallet = Arc::clone(&wallet);
        let wallet_id = wallet_id.to_string();
        std::thread::spawn(move || {
            if handle.wait() {
                wallet.write().expect("wallet lock").set_registered();
                let zc = zc_packet_for(&*zeroconf, &scr_addrs);
                bus.push(Notification::Refresh {
                    scope: RefreshScope::AndRescan,
                    wallet_id: Some(wallet_id),
                    zc: Some(zc),
                });
            }
        });
        Ok(false)
    }

    pub fn scr_address_is_registered(&self, scr_addr: &ScrAddr) -> bool {
        self.manager.filter().is_registered(scr_addr)
    }

    /// Snapshot probe across both groups, under the read locks.
    pub fn has_scr_address(&self, scr_addr: &ScrAddr) -> bool {
        for group in &self.groups {
            for wallet in group.wallet_map().values() {
                if wallet
                    .read()
                    .expect("wallet lock")
                    .has_scr_address(scr_addr)
                {
                    return true;
                }
            }
        }
        false
    }

    pub fn get_wallet_or_lockbox(&self, wallet_id: &str) -> Option<Arc<RwLock<Wallet>>> {
        self.groups[GROUP_WALLET]
            .wallet_by_id(wallet_id)
            .or_else(|| self.groups[GROUP_LOCKBOX].wallet_by_id(wallet_id))
    }

    // ------------------------------------------------------------------
    // Scan protocol

    /// Apply one notification to every group. Returns the fresh zero-conf
    /// ledger entries, which callers may forward (the `Zc` event's output).
    pub fn scan_wallets(
        &self,
        action: &Notification,
    ) -> Result<BTreeMap<LedgerKey, LedgerEntry>, ViewError> {
        let top = self.manager.top_block_height();

        let mut refresh = false;
        let mut reorg = false;
        let start_block;
        let end_block;
        let prev_top_block;
        let mut scan;

        match action {
            Notification::Init => {
                scan = ScanWalletStruct::new(ScanAction::Init);
                prev_top_block = 0;
                start_block = 0;
                end_block = top;
                refresh = true;
            }
            Notification::NewBlock(data) => {
                if !data.reorg_state.has_new_top {
                    return Ok(BTreeMap::new());
                }
                scan = ScanWalletStruct::new(ScanAction::NewBlock);
                reorg = !data.reorg_state.prev_top_still_valid;
                if reorg {
                    ledgerd_log::log_warn!("rescanning wallets from the reorg branch point");
                }
                let prev_height = self
                    .manager
                    .header_by_hash(&data.reorg_state.prev_top)
                    .map(|record| record.height)
                    .unwrap_or(0);
                start_block = if reorg {
                    self.manager
                        .header_by_hash(&data.reorg_state.reorg_branch_point)
                        .map(|record| record.height)
                        .unwrap_or(0)
                } else {
                    prev_height
                };
                end_block = self
                    .manager
                    .header_by_hash(&data.reorg_state.new_top)
                    .map(|record| record.height)
                    .unwrap_or(top);
                if let Some(purge) = &data.zc_purge {
                    scan.invalidated_zc_keys = purge.invalidated_zc_keys.clone();
                    scan.mined_txio_keys = purge.mined_txio_keys.clone();
                }
                prev_top_block = prev_height + 1;
            }
            Notification::Zc(packet) => {
                scan = ScanWalletStruct::new(ScanAction::Zc);
                scan.zc_map = packet.txio_map.clone();
                scan.new_zc_keys = packet.new_zc_keys.clone();
                scan.zc_tx_hashes = packet.tx_hashes.clone();
                if let Some(purge) = &packet.purge_packet {
                    scan.invalidated_zc_keys = purge.invalidated_zc_keys.clone();
                    scan.mined_txio_keys = purge.mined_txio_keys.clone();
                }
                start_block = top;
                end_block = top;
                prev_top_block = top;
            }
            Notification::Refresh { zc, .. } => {
                scan = ScanWalletStruct::new(ScanAction::Refresh);
                if let Some(zc) = zc {
                    scan.zc_map = zc.txio_map.clone();
                    scan.new_zc_keys = zc.new_zc_keys.clone();
                    scan.zc_tx_hashes = zc.tx_hashes.clone();
                }
                refresh = true;
                start_block = top;
                end_block = top;
                prev_top_block = top;
            }
        }

        let mut start_blocks = vec![start_block; self.groups.len()];
        for (index, group) in self.groups.iter().enumerate() {
            if group.page_history(&self.manager, refresh)? == PagingOutcome::Repaged {
                start_blocks[index] = group.page_bottom(0).unwrap_or(start_block);
            }
        }

        self.update_id.fetch_add(1, Ordering::AcqRel);

        let mut zc_entries = BTreeMap::new();
        for (index, group) in self.groups.iter().enumerate() {
            scan.start_block = start_blocks[index];
            scan.end_block = end_block;
            scan.prev_top_block = prev_top_block;
            scan.reorg = reorg;
            zc_entries.extend(group.scan_wallets(&self.manager, &scan)?);
        }

        self.last_scanned.store(end_block, Ordering::Release);
        Ok(zc_entries)
    }

    /// Shape an ingest pass's outcome into the `NewBlock` notification the
    /// scan protocol consumes.
    pub fn new_block_notification(
        &self,
        update: &ledgerd_chainstate::manager::UpdateResult,
        zc_purge: Option<crate::zeroconf::ZcPurgePacket>,
    ) -> Notification {
        let reorg_branch_point = update
            .reorg
            .as_ref()
            .map(|reorg| reorg.branch_point)
            .unwrap_or(update.prev_top_hash);
        Notification::NewBlock(crate::notify::NewBlockData {
            reorg_state: ledgerd_chainstate::headerchain::ReorgState {
                has_new_top: update.new_top_hash != update.prev_top_hash,
                prev_top_still_valid: update.reorg.is_none(),
                prev_top: update.prev_top_hash,
                new_top: update.new_top_hash,
                reorg_branch_point,
            },
            zc_purge,
        })
    }

    pub fn flag_refresh(
        &self,
        scope: RefreshScope,
        wallet_id: Option<String>,
        zc: Option<ZcPacket>,
    ) {
        self.bus.push(Notification::Refresh {
            scope,
            wallet_id,
            zc,
        });
    }

    // ------------------------------------------------------------------
    // History pages and delegates

    pub fn get_wallets_page_count(&self) -> usize {
        self.groups[GROUP_WALLET].page_count()
    }

    pub fn get_wallets_history_page(
        &self,
        page_id: u32,
        rebuild_ledger: bool,
        remap_wallets: bool,
    ) -> Result<Vec<LedgerEntry>, ViewError> {
        self.groups[GROUP_WALLET].get_history_page(
            &self.manager,
            page_id,
            self.update_id(),
            rebuild_ledger,
            remap_wallets,
        )
    }

    pub fn get_lockboxes_page_count(&self) -> usize {
        self.groups[GROUP_LOCKBOX].page_count()
    }

    pub fn get_lockboxes_history_page(
        &self,
        page_id: u32,
        rebuild_ledger: bool,
        remap_wallets: bool,
    ) -> Result<Vec<LedgerEntry>, ViewError> {
        self.groups[GROUP_LOCKBOX].get_history_page(
            &self.manager,
            page_id,
            self.update_id(),
            rebuild_ledger,
            remap_wallets,
        )
    }

    pub fn update_wallets_ledger_filter(&self, wallet_ids: &[String]) -> Result<(), ViewError> {
        if self.groups[GROUP_WALLET].update_ledger_filter(&self.manager, wallet_ids)? {
            self.flag_refresh(RefreshScope::FilterChanged, None, None);
        }
        Ok(())
    }

    pub fn update_lockboxes_ledger_filter(&self, wallet_ids: &[String]) -> Result<(), ViewError> {
        if self.groups[GROUP_LOCKBOX].update_ledger_filter(&self.manager, wallet_ids)? {
            self.flag_refresh(RefreshScope::FilterChanged, None, None);
        }
        Ok(())
    }

    pub fn get_ledger_delegate_for_wallets(&self) -> LedgerDelegate {
        self.group_delegate(GROUP_WALLET)
    }

    pub fn get_ledger_delegate_for_lockboxes(&self) -> LedgerDelegate {
        self.group_delegate(GROUP_LOCKBOX)
    }

    fn group_delegate(&self, group_index: usize) -> LedgerDelegate {
        let group = Arc::clone(&self.groups[group_index]);
        let manager = Arc::clone(&self.manager);
        let update_id = Arc::clone(&self.update_id);

        let page_group = Arc::clone(&group);
        let page_manager = Arc::clone(&manager);
        let vicinity_group = Arc::clone(&group);

        LedgerDelegate {
            get_page: Box::new(move |page_id| {
                page_group.get_history_page(
                    &page_manager,
                    page_id,
                    update_id.load(Ordering::Acquire),
                    false,
                    false,
                )
            }),
            get_block_in_vicinity: Box::new(move |height| {
                vicinity_group
                    .block_in_vicinity(height)
                    .ok_or(ViewError::PageOutOfRange)
            }),
            get_page_id_for_height: Box::new(move |height| {
                group
                    .page_id_for_block_height(height)
                    .ok_or(ViewError::PageOutOfRange)
            }),
        }
    }

    pub fn get_ledger_delegate_for_scr_addr(
        &self,
        wallet_id: &str,
        scr_addr: ScrAddr,
    ) -> Result<LedgerDelegate, ViewError> {
        let wallet = self
            .get_wallet_or_lockbox(wallet_id)
            .ok_or(ViewError::UnknownWallet)?;
        if !wallet
            .read()
            .expect("wallet lock")
            .has_scr_address(&scr_addr)
        {
            return Err(ViewError::UnknownScrAddr);
        }

        let manager = Arc::clone(&self.manager);
        let page_wallet = Arc::clone(&wallet);
        let page_manager = Arc::clone(&manager);
        let vicinity_wallet = Arc::clone(&wallet);
        let vicinity_manager = Arc::clone(&manager);

        Ok(LedgerDelegate {
            get_page: Box::new(move |page_id| {
                let mut wallet = page_wallet.write().expect("wallet lock");
                wallet
                    .scr_addr_obj_mut(&scr_addr)
                    .ok_or(ViewError::UnknownScrAddr)?
                    .get_history_page_by_id(&page_manager, page_id)
            }),
            get_block_in_vicinity: Box::new(move |height| {
                let mut wallet = vicinity_wallet.write().expect("wallet lock");
                wallet
                    .scr_addr_obj_mut(&scr_addr)
                    .ok_or(ViewError::UnknownScrAddr)?
                    .block_in_vicinity(&vicinity_manager, height)
            }),
            get_page_id_for_height: Box::new(move |height| {
                let mut wallet = wallet.write().expect("wallet lock");
                wallet
                    .scr_addr_obj_mut(&scr_addr)
                    .ok_or(ViewError::UnknownScrAddr)?
                    .page_id_for_block_height(&manager, height)
            }),
        })
    }

    /// Ad-hoc group over a chosen set of wallets with its own pager.
    pub fn get_standalone_wallet_group(
        &self,
        wallet_ids: &[String],
        ordering: HistoryOrdering,
    ) -> Result<Arc<WalletGroup>, ViewError> {
        let group = WalletGroup::new(ordering);
        for wallet_id in wallet_ids {
            if let Some(wallet) = self.get_wallet_or_lockbox(wallet_id) {
                group.insert_wallet(wallet);
            }
        }
        group.page_history(&self.manager, true)?;
        Ok(Arc::new(group))
    }

    // ------------------------------------------------------------------
    // Chain and balance queries

    pub fn get_top_block_height(&self) -> u32 {
        self.manager.top_block_height()
    }

    pub fn get_block_time_by_height(&self, height: u32) -> Option<u32> {
        self.manager.block_time_by_height(height)
    }

    pub fn get_closest_block_height_for_time(&self, timestamp: u32) -> u32 {
        self.manager.closest_block_height_for_time(timestamp)
    }

    /// Confirmed lookup first, zero-conf fallback.
    pub fn get_tx_by_hash(&self, tx_hash: &Hash256) -> Result<Option<Transaction>, ViewError> {
        if let Some(tx) = self.manager.tx_by_hash(tx_hash)? {
            return Ok(Some(tx));
        }
        Ok(self.zeroconf.get_tx_by_hash(tx_hash))
    }

    pub fn is_tx_main_branch(&self, tx_hash: &Hash256) -> Result<bool, ViewError> {
        Ok(self.manager.is_tx_main_branch(tx_hash)?)
    }

    /// BIP-125 signalling, checked against the mempool's copy.
    pub fn is_rbf(&self, tx_hash: &Hash256) -> bool {
        self.zeroconf
            .get_tx_by_hash(tx_hash)
            .map(|tx| tx.is_rbf())
            .unwrap_or(false)
    }

    pub fn get_spender_tx_for_tx_out(
        &self,
        height: u32,
        tx_index: u16,
        out_index: u16,
    ) -> Result<Option<(Transaction, Hash256)>, ViewError> {
        Ok(self
            .manager
            .spender_tx_for_tx_out(height, tx_index, out_index)?)
    }

    /// `(totalUnspent, totalTxioCount)` straight from the SSH summary.
    pub fn get_addr_full_balance(&self, scr_addr: &ScrAddr) -> Result<(u64, u64), ViewError> {
        Ok(self.manager.addr_full_balance(scr_addr)?)
    }

    /// Unspent outputs over a list of addresses, overlaying zero-conf
    /// spends and (unless `ignore_zc`) zero-conf outputs at the sentinel
    /// height. Unregistered addresses are a range error outside super-node
    /// mode.
    pub fn get_unspent_tx_outs_for_addr_list(
        &self,
        scr_addrs: &[ScrAddr],
        ignore_zc: bool,
    ) -> Result<Vec<UnspentTxOut>, ViewError> {
        let filter = self.manager.filter();
        if !filter.is_super_node() {
            for scr_addr in scr_addrs {
                if !filter.is_registered(scr_addr) {
                    return Err(ViewError::UnknownScrAddr);
                }
            }
        }

        let mut utxos = Vec::new();
        for scr_addr in scr_addrs {
            let zc_txios = self.zeroconf.get_unspent_zc_for_scr_addr(scr_addr);

            for (key, utxo) in self.manager.unspent_tx_outs_for_scr_addr(scr_addr)? {
                if let Some(zc_txio) = zc_txios.get(&key) {
                    if zc_txio.has_txin_zc() {
                        continue;
                    }
                }
                utxos.push(utxo);
            }

            if ignore_zc {
                continue;
            }

            for txio in zc_txios.values() {
                if !txio.has_txout_zc() || txio.has_txin_zc() {
                    continue;
                }
                let zc_tx_key = txio.txout_key.tx_key();
                let Some(tx_hash) = self.zeroconf.tx_hash_for_zc_key(&zc_tx_key) else {
                    continue;
                };
                let script_pubkey = self
                    .zeroconf
                    .get_tx_by_hash(&tx_hash)
                    .and_then(|tx| {
                        tx.vout
                            .get(txio.txout_key.out_index() as usize)
                            .map(|out| out.script_pubkey.clone())
                    })
                    .unwrap_or_default();
                utxos.push(UnspentTxOut {
                    tx_hash,
                    tx_out_index: txio.txout_key.out_index() as u32,
                    height: u32::MAX,
                    value: txio.value,
                    script_pubkey,
                });
            }
        }
        Ok(utxos)
    }

    /// Build a zero-conf packet from the provider, filtered by address.
    pub fn create_zc_notification(
        &self,
        mut filter: impl FnMut(&ScrAddr) -> bool,
    ) -> ZcPacket {
        let mut packet = ZcPacket::default();
        for (scr_addr, txio_map) in self.zeroconf.get_full_txio_map() {
            if !filter(&scr_addr) {
                continue;
            }
            for txio in txio_map.values() {
                let zc_key = if txio.txout_key.is_zero_conf() {
                    Some(txio.txout_key.tx_key())
                } else {
                    txio.txin_key
                        .filter(|key| key.is_zero_conf())
                        .map(|key| key.tx_key())
                };
                if let Some(zc_key) = zc_key {
                    packet.new_zc_keys.insert(zc_key);
                    if let Some(tx_hash) = self.zeroconf.tx_hash_for_zc_key(&zc_key) {
                        packet.tx_hashes.insert(zc_key, tx_hash);
                    }
                }
            }
            packet.txio_map.insert(scr_addr, txio_map);
        }
        packet
    }

    pub fn reset(&self) {
        for group in &self.groups {
            group.reset();
        }
        self.last_scanned.store(0, Ordering::Release);
    }
}

fn zc_packet_for<Z: ZeroConfSource>(zeroconf: &Z, scr_addrs: &[ScrAddr]) -> ZcPacket {
    let mut packet = ZcPacket::default();
    for (scr_addr, txio_map) in zeroconf.get_full_txio_map() {
        if !scr_addrs.contains(&scr_addr) {
            continue;
        }
        for txio in txio_map.values() {
            let zc_key = if txio.txout_key.is_zero_conf() {
                Some(txio.txout_key.tx_key())
            } else {
                txio.txin_key
                    .filter(|key| key.is_zero_conf())
                    .map(|key| key.tx_key())
            };
            if let Some(zc_key) = zc_key {
                packet.new_zc_keys.insert(zc_key);
                if let Some(tx_hash) = zeroconf.tx_hash_for_zc_key(&zc_key) {
                    packet.tx_hashes.insert(zc_key, tx_hash);
                }
            }
        }
        packet.txio_map.insert(scr_addr, txio_map);
    }
    packet
}
