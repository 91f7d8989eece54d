//! The block writer: applies and undoes blocks against the store.
//!
//! The writer is a batcher. It holds dirty caches of stxo rows, tx-index
//! entries and SSH rows over a pending `WriteBatch`; every read consults
//! the caches before the store, so a block can spend outputs created by an
//! earlier uncommitted block. `commit` flushes everything atomically, and
//! the accumulated-bytes threshold paces commits on whole-block boundaries.

use std::collections::{HashMap, HashSet};

use ledgerd_primitives::script::{classify_script_pubkey, ScriptType};
use ledgerd_primitives::{scr_addr_for_script, Block, Hash256, OutPoint, ScrAddr};
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};
use rayon::prelude::*;

use crate::dbinfo::StoredDbInfo;
use crate::filter::AddressFilter;
use crate::keys::{hgtx, hgtx_key, sub_hist_key, TxInKey, TxKey, TxOutKey};
use crate::ssh::{StoredScriptHistory, StoredSubHistory, TxIOPair};
use crate::stxo::StoredTxOut;
use crate::undo::{AddedOutPoint, RemovedStxo, StoredUndoData};
use crate::ChainError;

pub const UPDATE_BYTES_THRESH: usize = 64 * 1024 * 1024;

/// Blocks with at least this many transactions hash them in parallel.
const PAR_HASH_MIN_TXS: usize = 8;

struct SshCacheEntry {
    summary: StoredScriptHistory,
    existed: bool,
    sub: HashMap<u32, StoredSubHistory>,
    dirty: bool,
}

pub struct BlockWriter<'a, S> {
    store: &'a S,
    batch: WriteBatch,
    pending_bytes: usize,
    update_bytes_thresh: usize,
    ssh_only: bool,
    update_dbinfo: bool,
    stxo_cache: HashMap<TxOutKey, StoredTxOut>,
    stxo_dirty: HashSet<TxOutKey>,
    stxo_deleted: HashSet<TxOutKey>,
    tx_keys: HashMap<Hash256, TxKey>,
    tx_keys_dirty: HashSet<Hash256>,
    tx_keys_deleted: HashSet<Hash256>,
    ssh_cache: HashMap<ScrAddr, SshCacheEntry>,
    dbinfo: Option<StoredDbInfo>,
}

impl<'a, S: KeyValueStore> BlockWriter<'a, S> {
    pub fn new(store: &'a S, update_bytes_thresh: usize) -> Self {
        Self {
            store,
            batch: WriteBatch::new(),
            pending_bytes: 0,
            update_bytes_thresh,
            ssh_only: false,
            update_dbinfo: true,
            stxo_cache: HashMap::new(),
            stxo_dirty: HashSet::new(),
            stxo_deleted: HashSet::new(),
            tx_keys: HashMap::new(),
            tx_keys_dirty: HashSet::new(),
            tx_keys_deleted: HashSet::new(),
            ssh_cache: HashMap::new(),
            dbinfo: None,
        }
    }

    /// Writer for a side scan: only SSH rows are touched, the raw block,
    /// stxo, tx-index, undo and DBINFO rows are left alone.
    pub fn for_side_scan(store: &'a S, update_bytes_thresh: usize) -> Self {
        let mut writer = Self::new(store, update_bytes_thresh);
        writer.ssh_only = true;
        writer.update_dbinfo = false;
        writer
    }

    pub fn set_update_dbinfo(&mut self, update: bool) {
        self.update_dbinfo = update;
    }

    /// Stage a Headers row; reorgs rewrite both branches' rows in the same
    /// batch as the undo and replay.
    pub fn put_header_row(&mut self, hash: &Hash256, row: Vec<u8>) {
        self.pending_bytes += 32 + row.len();
        self.batch.put(Column::Headers, *hash, row);
    }

    /// Store the raw payload row without applying the block (fork blocks
    /// are stored but not applied until a reorg promotes them).
    pub fn store_raw_block(&mut self, height: u32, duplicate_id: u8, raw: &[u8]) {
        let key = hgtx_key(hgtx(height, duplicate_id));
        self.batch.put(Column::BlkData, key, raw.to_vec());
        self.pending_bytes += raw.len();
    }

    /// Apply one parsed block: store the raw row, mark spent outputs,
    /// create the new ones, index registered script addresses and advance
    /// DBINFO. Returns the undo record that was persisted alongside.
    pub fn apply_block(
        &mut self,
        block: &Block,
        height: u32,
        duplicate_id: u8,
        raw: Option<&[u8]>,
        filter: &dyn AddressFilter,
    ) -> Result<StoredUndoData, ChainError> {
        let hgtx_val = hgtx(height, duplicate_id);
        let block_hash = block.header.hash();

        if !self.ssh_only {
            match raw {
                Some(bytes) => self.store_raw_block(height, duplicate_id, bytes),
                None => {
                    let bytes = block.consensus_encode();
                    self.store_raw_block(height, duplicate_id, &bytes);
                }
            }
        }

        let txids: Vec<Hash256> = if block.transactions.len() >= PAR_HASH_MIN_TXS {
            block.transactions.par_iter().map(|tx| tx.txid()).collect()
        } else {
            block.transactions.iter().map(|tx| tx.txid()).collect()
        };

        let mut sud = StoredUndoData {
            block_hash,
            height,
            duplicate_id,
            stxos_removed: Vec::new(),
            outpoints_added: Vec::new(),
        };

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let tx_key = TxKey::new(hgtx_val, tx_index as u16);
            let txid = txids[tx_index];
            if !self.ssh_only {
                self.put_tx_key(txid, tx_key);
            }

            for (in_index, input) in tx.vin.iter().enumerate() {
                if input.is_coinbase() {
                    continue;
                }
                let prev_tx_key = self
                    .lookup_tx_key(&input.prevout.hash)?
                    .ok_or(ChainError::MissingInput)?;
                let prev_key = TxOutKey::new(prev_tx_key, input.prevout.index as u16);
                let mut stxo = self.get_stxo(&prev_key)?.ok_or(ChainError::MissingInput)?;

                let mut removed = RemovedStxo {
                    outpoint: input.prevout.clone(),
                    key: prev_key,
                    stxo: stxo.clone(),
                };
                removed.stxo.spent_by = None;
                sud.stxos_removed.push(removed);

                let txin_key = TxInKey::new(tx_key, in_index as u16);
                if !self.ssh_only {
                    stxo.spent_by = Some(txin_key);
                }
                let script = stxo.script_pubkey.clone();
                let value = stxo.value;
                if !self.ssh_only {
                    self.put_stxo(prev_key, stxo);
                }

                if let Some(scr_addr) = scr_addr_for_script(&script) {
                    if filter.contains(&scr_addr) {
                        self.mark_txio_spent(&scr_addr, &prev_key, txin_key, value, hgtx_val)?;
                    }
                }
            }

            for (out_index, output) in tx.vout.iter().enumerate() {
                let key = TxOutKey::new(tx_key, out_index as u16);
                let stxo = StoredTxOut {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    is_coinbase: tx.is_coinbase(),
                    spent_by: None,
                };
                if !self.ssh_only {
                    self.put_stxo(key, stxo);
                }
                sud.outpoints_added.push(AddedOutPoint {
                    outpoint: OutPoint {
                        hash: txid,
                        index: out_index as u32,
                    },
                    key,
                });

                if let Some(scr_addr) = scr_addr_for_script(&output.script_pubkey) {
                    if filter.contains(&scr_addr) {
                        let is_multisig = classify_script_pubkey(&output.script_pubkey)
                            == ScriptType::Multisig;
                        let mut txio = TxIOPair::new(key, output.value);
                        txio.is_from_coinbase = tx.is_coinbase();
                        txio.is_multisig = is_multisig;
                        self.insert_txio(&scr_addr, hgtx_val, txio, height)?;
                    }
                }
            }
        }

        if !self.ssh_only {
            let encoded = sud.encode();
            self.pending_bytes += encoded.len();
            self.batch.put(Column::Undo, hgtx_key(hgtx_val), encoded);

            if self.update_dbinfo {
                let info = self.dbinfo_mut()?;
                info.top_blk_height = height;
                info.top_blk_hash = block_hash;
                info.applied_to_height = height;
                info.top_scanned_blk_hash = block_hash;
            }
        }

        if self.pending_bytes >= self.update_bytes_thresh {
            self.commit()?;
        }

        Ok(sud)
    }

    /// Reverse one applied block using its undo record.
    pub fn undo_block(
        &mut self,
        sud: &StoredUndoData,
        parent_hash: Hash256,
        filter: &dyn AddressFilter,
    ) -> Result<(), ChainError> {
        let hgtx_val = hgtx(sud.height, sud.duplicate_id);

        // Outputs this block spent come back unspent. This pass runs first
        // so the deletion pass below wins for outputs both created and
        // spent inside the block.
        for removed in &sud.stxos_removed {
            let mut stxo = removed.stxo.clone();
            stxo.spent_by = None;
            let script = stxo.script_pubkey.clone();
            let value = stxo.value;
            self.put_stxo(removed.key, stxo);
            if let Some(scr_addr) = scr_addr_for_script(&script) {
                if filter.contains(&scr_addr) {
                    self.mark_txio_unspent(&scr_addr, &removed.key, value, hgtx_val)?;
                }
            }
        }

        // Then every output this block created goes away.
        for added in sud.outpoints_added.iter().rev() {
            let stxo = self.get_stxo(&added.key)?;
            self.delete_stxo(added.key);
            self.delete_tx_key(added.outpoint.hash);
            if let Some(stxo) = stxo {
                if let Some(scr_addr) = scr_addr_for_script(&stxo.script_pubkey) {
                    if filter.contains(&scr_addr) {
                        self.remove_txio(&scr_addr, hgtx_val, &added.key)?;
                    }
                }
            }
        }

        self.batch.delete(Column::Undo, hgtx_key(hgtx_val));

        if self.update_dbinfo && sud.height > 0 {
            let info = self.dbinfo_mut()?;
            info.top_blk_height = sud.height - 1;
            info.top_blk_hash = parent_hash;
            info.applied_to_height = sud.height - 1;
            info.top_scanned_blk_hash = parent_hash;
        }

        Ok(())
    }

    /// Flush every dirty row plus the pending batch in one atomic write.
    pub fn commit(&mut self) -> Result<(), ChainError> {
        for key in self.stxo_dirty.iter() {
            let stxo = self.stxo_cache.get(key).expect("dirty stxo cached");
            self.batch.put(Column::Stxo, key.as_bytes(), stxo.encode());
        }
        for key in self.stxo_deleted.iter() {
            self.batch.delete(Column::Stxo, key.as_bytes());
        }
        for txid in self.tx_keys_dirty.iter() {
            let tx_key = self.tx_keys.get(txid).expect("dirty tx key cached");
            self.batch.put(Column::TxIndex, *txid, tx_key.as_bytes());
        }
        for txid in self.tx_keys_deleted.iter() {
            self.batch.delete(Column::TxIndex, *txid);
        }
        for (scr_addr, entry) in self.ssh_cache.iter() {
            if !entry.dirty {
                continue;
            }
            if entry.summary.total_txio_count > 0 {
                self.batch.put(
                    Column::ScriptHist,
                    scr_addr.as_bytes(),
                    entry.summary.encode(),
                );
            } else if entry.existed {
                self.batch.delete(Column::ScriptHist, scr_addr.as_bytes());
            } else {
                // Never materialized; nothing to clear.
            }
            for (bucket_hgtx, bucket) in entry.sub.iter() {
                let key = sub_hist_key(scr_addr, *bucket_hgtx);
                if bucket.is_empty() {
                    self.batch.delete(Column::SubHist, key);
                } else {
                    self.batch.put(Column::SubHist, key, bucket.encode());
                }
            }
        }
        if let Some(info) = &self.dbinfo {
            info.put(&mut self.batch);
        }

        self.store.write_batch(&self.batch)?;

        self.batch = WriteBatch::new();
        self.pending_bytes = 0;
        self.stxo_cache.clear();
        self.stxo_dirty.clear();
        self.stxo_deleted.clear();
        self.tx_keys.clear();
        self.tx_keys_dirty.clear();
        self.tx_keys_deleted.clear();
        self.ssh_cache.clear();
        self.dbinfo = None;
        Ok(())
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    fn lookup_tx_key(&mut self, txid: &Hash256) -> Result<Option<TxKey>, ChainError> {
        if self.tx_keys_deleted.contains(txid) {
            return Ok(None);
        }
        if let Some(key) = self.tx_keys.get(txid) {
            return Ok(Some(*key));
        }
        let Some(bytes) = self.store.get(Column::TxIndex, txid)? else {
            return Ok(None);
        };
        let key = TxKey::from_slice(&bytes).ok_or(ChainError::Corruption("bad tx index row"))?;
        self.tx_keys.insert(*txid, key);
        Ok(Some(key))
    }

    fn put_tx_key(&mut self, txid: Hash256, key: TxKey) {
        self.tx_keys.insert(txid, key);
        self.tx_keys_dirty.insert(txid);
        self.tx_keys_deleted.remove(&txid);
        self.pending_bytes += 38;
    }

    fn delete_tx_key(&mut self, txid: Hash256) {
        self.tx_keys.remove(&txid);
        self.tx_keys_dirty.remove(&txid);
        self.tx_keys_deleted.insert(txid);
    }

    fn get_stxo(&mut self, key: &TxOutKey) -> Result<Option<StoredTxOut>, ChainError> {
        if self.stxo_deleted.contains(key) {
            return Ok(None);
        }
        if let Some(stxo) = self.stxo_cache.get(key) {
            return Ok(Some(stxo.clone()));
        }
        let Some(bytes) = self.store.get(Column::Stxo, key.as_bytes())? else {
            return Ok(None);
        };
        let stxo = StoredTxOut::decode(&bytes)?;
        self.stxo_cache.insert(*key, stxo.clone());
        Ok(Some(stxo))
    }

    fn put_stxo(&mut self, key: TxOutKey, stxo: StoredTxOut) {
        self.pending_bytes += 24 + stxo.script_pubkey.len();
        self.stxo_cache.insert(key, stxo);
        self.stxo_dirty.insert(key);
        self.stxo_deleted.remove(&key);
    }

    fn delete_stxo(&mut self, key: TxOutKey) {
        self.stxo_cache.remove(&key);
        self.stxo_dirty.remove(&key);
        self.stxo_deleted.insert(key);
    }

    fn ensure_ssh(&mut self, scr_addr: &ScrAddr) -> Result<(), ChainError> {
        if self.ssh_cache.contains_key(scr_addr) {
            return Ok(());
        }
        let stored = self.store.get(Column::ScriptHist, scr_addr.as_bytes())?;
        let existed = stored.is_some();
        let summary = match stored {
            Some(bytes) => StoredScriptHistory::decode(&bytes)?,
            None => StoredScriptHistory::default(),
        };
        self.ssh_cache.insert(
            *scr_addr,
            SshCacheEntry {
                summary,
                existed,
                sub: HashMap::new(),
                dirty: false,
            },
        );
        Ok(())
    }

    fn ensure_bucket(&mut self, scr_addr: &ScrAddr, bucket_hgtx: u32) -> Result<(), ChainError> {
        self.ensure_ssh(scr_addr)?;
        let entry = self.ssh_cache.get(scr_addr).expect("ssh entry ensured");
        if entry.sub.contains_key(&bucket_hgtx) {
            return Ok(());
        }
        let key = sub_hist_key(scr_addr, bucket_hgtx);
        let bucket = match self.store.get(Column::SubHist, &key)? {
            Some(bytes) => StoredSubHistory::decode(&bytes)?,
            None => StoredSubHistory::default(),
        };
        self.ssh_cache
            .get_mut(scr_addr)
            .expect("ssh entry ensured")
            .sub
            .insert(bucket_hgtx, bucket);
        Ok(())
    }

    fn insert_txio(
        &mut self,
        scr_addr: &ScrAddr,
        bucket_hgtx: u32,
        txio: TxIOPair,
        height: u32,
    ) -> Result<(), ChainError> {
        self.ensure_bucket(scr_addr, bucket_hgtx)?;
        let entry = self.ssh_cache.get_mut(scr_addr).expect("ssh entry");
        let bucket = entry.sub.get_mut(&bucket_hgtx).expect("bucket ensured");
        if bucket.txio.contains_key(&txio.txout_key) {
            return Ok(());
        }
        let value = txio.value;
        bucket.txio.insert(txio.txout_key, txio);
        if entry.summary.total_txio_count == 0 {
            entry.summary.scanned_up_to = height;
        }
        entry.summary.total_txio_count += 1;
        entry.summary.total_received += value;
        entry.summary.total_unspent += value;
        entry.dirty = true;
        self.pending_bytes += 32;
        Ok(())
    }

    /// Mark the TxIO spent in its output bucket and mirror the spent pair
    /// into the spender's height bucket, so both pages of history see the
    /// event.
    fn mark_txio_spent(
        &mut self,
        scr_addr: &ScrAddr,
        txout_key: &TxOutKey,
        txin_key: TxInKey,
        value: u64,
        spend_hgtx: u32,
    ) -> Result<(), ChainError> {
        let out_hgtx = txout_key.tx_key().hgtx();
        self.ensure_bucket(scr_addr, out_hgtx)?;
        self.ensure_bucket(scr_addr, spend_hgtx)?;
        let entry = self.ssh_cache.get_mut(scr_addr).expect("ssh entry");
        let out_bucket = entry.sub.get_mut(&out_hgtx).expect("bucket ensured");
        let Some(txio) = out_bucket.txio.get_mut(txout_key) else {
            // The output pre-dates the address' first scan height.
            return Ok(());
        };
        if txio.txin_key.is_some() {
            return Ok(());
        }
        txio.txin_key = Some(txin_key);
        txio.txin_zc = false;
        let spent_copy = txio.clone();
        if spend_hgtx != out_hgtx {
            let spend_bucket = entry.sub.get_mut(&spend_hgtx).expect("bucket ensured");
            spend_bucket.txio.insert(*txout_key, spent_copy);
        }
        entry.summary.total_unspent = entry.summary.total_unspent.saturating_sub(value);
        entry.dirty = true;
        Ok(())
    }

    fn mark_txio_unspent(
        &mut self,
        scr_addr: &ScrAddr,
        txout_key: &TxOutKey,
        value: u64,
        spend_hgtx: u32,
    ) -> Result<(), ChainError> {
        let out_hgtx = txout_key.tx_key().hgtx();
        self.ensure_bucket(scr_addr, out_hgtx)?;
        self.ensure_bucket(scr_addr, spend_hgtx)?;
        let entry = self.ssh_cache.get_mut(scr_addr).expect("ssh entry");
        if spend_hgtx != out_hgtx {
            let spend_bucket = entry.sub.get_mut(&spend_hgtx).expect("bucket ensured");
            if spend_bucket.txio.remove(txout_key).is_some() {
                entry.dirty = true;
            }
        }
        let out_bucket = entry.sub.get_mut(&out_hgtx).expect("bucket ensured");
        let Some(txio) = out_bucket.txio.get_mut(txout_key) else {
            return Ok(());
        };
        if txio.txin_key.is_some() {
            txio.txin_key = None;
            txio.txin_zc = false;
            entry.summary.total_unspent += value;
            entry.dirty = true;
        }
        Ok(())
    }

    fn remove_txio(
        &mut self,
        scr_addr: &ScrAddr,
        bucket_hgtx: u32,
        txout_key: &TxOutKey,
    ) -> Result<(), ChainError> {
        self.ensure_bucket(scr_addr, bucket_hgtx)?;
        let entry = self.ssh_cache.get_mut(scr_addr).expect("ssh entry");
        let bucket = entry.sub.get_mut(&bucket_hgtx).expect("bucket ensured");
        let Some(txio) = bucket.txio.remove(txout_key) else {
            return Ok(());
        };
        entry.summary.total_txio_count = entry.summary.total_txio_count.saturating_sub(1);
        entry.summary.total_received = entry.summary.total_received.saturating_sub(txio.value);
        if txio.txin_key.is_none() {
            entry.summary.total_unspent = entry.summary.total_unspent.saturating_sub(txio.value);
        }
        entry.dirty = true;
        Ok(())
    }

    fn dbinfo_mut(&mut self) -> Result<&mut StoredDbInfo, ChainError> {
        if self.dbinfo.is_none() {
            let info = StoredDbInfo::load(self.store)?.ok_or(ChainError::MissingGenesis)?;
            self.dbinfo = Some(info);
        }
        Ok(self.dbinfo.as_mut().expect("dbinfo loaded"))
    }
}
