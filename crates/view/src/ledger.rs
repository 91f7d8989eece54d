//! Ledger entries: the per-transaction rows a wallet history is made of.

use ledgerd_primitives::Hash256;

/// Sort key of a ledger entry: block height, then tx position, then hash.
/// Zero-conf entries carry the `u32::MAX` height sentinel and sort last in
/// ascending order.
pub type LedgerKey = (u32, u16, Hash256);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HistoryOrdering {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LedgerEntry {
    pub wallet_id: String,
    pub value: i64,
    pub block_height: u32,
    pub tx_index: u16,
    pub tx_hash: Hash256,
    pub tx_time: u32,
    pub is_coinbase: bool,
    pub is_sent_to_self: bool,
    pub is_change_back: bool,
}

impl LedgerEntry {
    pub fn key(&self) -> LedgerKey {
        (self.block_height, self.tx_index, self.tx_hash)
    }

    pub fn is_zero_conf(&self) -> bool {
        self.block_height == u32::MAX
    }
}

pub fn sort_ledger(entries: &mut [LedgerEntry], ordering: HistoryOrdering) {
    match ordering {
        HistoryOrdering::Ascending => entries.sort_by(|a, b| a.key().cmp(&b.key())),
        HistoryOrdering::Descending => entries.sort_by(|a, b| b.key().cmp(&a.key())),
    }
}
