//! The reorganization engine.
//!
//! Walks the discarded branch tip-down undoing each block via its stored
//! undo record (synthesizing one from the stored rows when absent), flips
//! the main-branch marks on both branches' header rows, then replays the
//! new branch bottom-up. Everything stages into a single batch committed
//! once, so readers observe the pre-reorg state or the post-reorg state
//! and nothing in between.

use std::collections::BTreeSet;

use ledgerd_primitives::{Block, Hash256};
use ledgerd_storage::{Column, KeyValueStore};

use crate::filter::AddressFilter;
use crate::headerchain::{encode_header_record, HeaderChain, HeaderRecord, ReorgState};
use crate::keys::{hgtx, hgtx_key, TxKey, TxOutKey};
use crate::stxo::StoredTxOut;
use crate::undo::{AddedOutPoint, RemovedStxo, StoredUndoData};
use crate::writer::BlockWriter;
use crate::ChainError;

#[derive(Clone, Debug, Default)]
pub struct ReorgResult {
    /// Transactions only the discarded branch contained.
    pub removed_txes: Vec<Hash256>,
    /// Transactions only the new branch contained.
    pub added_txes: Vec<Hash256>,
    pub branch_point: Hash256,
    pub branch_point_height: u32,
    pub new_top_height: u32,
}

/// Undo the old branch down to the branch point, then (unless `only_undo`)
/// flip the duplicate-ID main marks and replay the new branch.
pub fn reassess_after_reorg<S: KeyValueStore>(
    store: &S,
    chain: &HeaderChain,
    state: &ReorgState,
    filter: &dyn AddressFilter,
    only_undo: bool,
) -> Result<ReorgResult, ChainError> {
    let branch_record = chain
        .header_by_hash(&state.reorg_branch_point)
        .ok_or(ChainError::MissingHeader)?;
    let branch_point_height = branch_record.height;

    // Never pace mid-reorg; one commit at the end.
    let mut writer = BlockWriter::new(store, usize::MAX);

    ledgerd_log::log_info!("invalidating old-chain transactions");

    let mut removed: BTreeSet<Hash256> = BTreeSet::new();
    let mut current = state.prev_top;
    while current != state.reorg_branch_point {
        let record = chain
            .header_by_hash(&current)
            .ok_or(ChainError::MissingHeader)?;
        let sud = load_or_synthesize_undo(store, record)?;
        for added in &sud.outpoints_added {
            removed.insert(added.outpoint.hash);
        }
        writer.undo_block(&sud, record.header.prev_block, filter)?;
        writer.put_header_row(&record.hash, encode_header_record(record));
        current = record.header.prev_block;
    }

    if only_undo {
        writer.commit()?;
        return Ok(ReorgResult {
            removed_txes: removed.into_iter().collect(),
            added_txes: Vec::new(),
            branch_point: state.reorg_branch_point,
            branch_point_height,
            new_top_height: branch_point_height,
        });
    }

    let new_top_record = chain
        .header_by_hash(&state.new_top)
        .ok_or(ChainError::MissingHeader)?;
    let new_top_height = new_top_record.height;

    ledgerd_log::log_info!("marking new-chain transactions valid");

    let mut added: BTreeSet<Hash256> = BTreeSet::new();
    for height in branch_point_height + 1..=new_top_height {
        let record = chain
            .header_by_height(height)
            .ok_or(ChainError::MissingHeader)?;
        writer.put_header_row(&record.hash, encode_header_record(record));

        let key = hgtx_key(hgtx(height, record.duplicate_id));
        let raw = store
            .get(Column::BlkData, &key)?
            .ok_or(ChainError::MissingBlockData)?;
        let block = Block::consensus_decode(&raw)?;
        let sud = writer.apply_block(&block, height, record.duplicate_id, Some(&raw), filter)?;
        for out in &sud.outpoints_added {
            added.insert(out.outpoint.hash);
        }
    }

    writer.commit()?;

    let removed_txes: Vec<Hash256> = removed.difference(&added).copied().collect();
    let added_txes: Vec<Hash256> = added.difference(&removed).copied().collect();

    Ok(ReorgResult {
        removed_txes,
        added_txes,
        branch_point: state.reorg_branch_point,
        branch_point_height,
        new_top_height,
    })
}

/// Fetch the undo record written at apply time, or rebuild it by
/// re-reading the stored block and the stxo rows it references.
fn load_or_synthesize_undo<S: KeyValueStore>(
    store: &S,
    record: &HeaderRecord,
) -> Result<StoredUndoData, ChainError> {
    let hgtx_val = hgtx(record.height, record.duplicate_id);
    if let Some(bytes) = store.get(Column::Undo, &hgtx_key(hgtx_val))? {
        return Ok(StoredUndoData::decode(&bytes)?);
    }

    let raw = store
        .get(Column::BlkData, &hgtx_key(hgtx_val))?
        .ok_or(ChainError::MissingBlockData)?;
    let block = Block::consensus_decode(&raw)?;

    let mut sud = StoredUndoData {
        block_hash: record.hash,
        height: record.height,
        duplicate_id: record.duplicate_id,
        stxos_removed: Vec::new(),
        outpoints_added: Vec::new(),
    };

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let tx_key = TxKey::new(hgtx_val, tx_index as u16);
        let txid = tx.txid();

        for input in &tx.vin {
            if input.is_coinbase() {
                continue;
            }
            let prev_bytes = store
                .get(Column::TxIndex, &input.prevout.hash)?
                .ok_or(ChainError::Corruption(
                    "missing referenced prior output during undo",
                ))?;
            let prev_tx_key = TxKey::from_slice(&prev_bytes)
                .ok_or(ChainError::Corruption("bad tx index row"))?;
            let prev_key = TxOutKey::new(prev_tx_key, input.prevout.index as u16);
            let stxo_bytes =
                store
                    .get(Column::Stxo, prev_key.as_bytes())?
                    .ok_or(ChainError::Corruption(
                        "missing referenced prior output during undo",
                    ))?;
            let mut stxo = StoredTxOut::decode(&stxo_bytes)?;
            stxo.spent_by = None;
            sud.stxos_removed.push(RemovedStxo {
                outpoint: input.prevout.clone(),
                key: prev_key,
                stxo,
            });
        }

        for (out_index, _) in tx.vout.iter().enumerate() {
            sud.outpoints_added.push(AddedOutPoint {
                outpoint: ledgerd_primitives::OutPoint {
                    hash: txid,
                    index: out_index as u32,
                },
                key: TxOutKey::new(tx_key, out_index as u16),
            });
        }
    }

    Ok(sud)
}
