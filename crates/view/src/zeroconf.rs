//! Zero-confirmation overlay: the packets the mempool provider feeds the
//! viewer, and the provider contract itself.

use std::collections::{BTreeMap, BTreeSet};

use ledgerd_chainstate::keys::{TxKey, TxOutKey};
use ledgerd_chainstate::ssh::TxIOPair;
use ledgerd_primitives::{Hash256, ScrAddr, Transaction};

/// Keys invalidated by a block arrival: transactions that mined and
/// transactions the mempool evicted.
#[derive(Clone, Debug, Default)]
pub struct ZcPurgePacket {
    pub invalidated_zc_keys: BTreeSet<TxKey>,
    pub mined_txio_keys: BTreeSet<TxKey>,
}

/// One mempool delta: per-address TxIO maps plus the keys that are new,
/// plus an optional purge.
#[derive(Clone, Debug, Default)]
pub struct ZcPacket {
    pub txio_map: BTreeMap<ScrAddr, BTreeMap<TxOutKey, TxIOPair>>,
    pub new_zc_keys: BTreeSet<TxKey>,
    pub tx_hashes: BTreeMap<TxKey, Hash256>,
    pub purge_packet: Option<ZcPurgePacket>,
}

/// The mempool provider the viewer consumes; supplied externally.
pub trait ZeroConfSource: Send + Sync {
    fn get_tx_by_hash(&self, tx_hash: &Hash256) -> Option<Transaction>;

    /// Current full per-address zero-conf TxIO overlay.
    fn get_full_txio_map(&self) -> BTreeMap<ScrAddr, BTreeMap<TxOutKey, TxIOPair>>;

    /// Zero-conf outputs of one address not themselves spent by another
    /// zero-conf transaction.
    fn get_unspent_zc_for_scr_addr(&self, scr_addr: &ScrAddr) -> BTreeMap<TxOutKey, TxIOPair>;

    /// The transaction hash behind a zero-conf tx key.
    fn tx_hash_for_zc_key(&self, key: &TxKey) -> Option<Hash256>;
}

/// A source with no mempool; every lookup comes back empty.
#[derive(Default)]
pub struct EmptyZeroConf;

impl ZeroConfSource for EmptyZeroConf {
    fn get_tx_by_hash(&self, _tx_hash: &Hash256) -> Option<Transaction> {
        None
    }

    fn get_full_txio_map(&self) -> BTreeMap<ScrAddr, BTreeMap<TxOutKey, TxIOPair>> {
        BTreeMap::new()
    }

    fn get_unspent_zc_for_scr_addr(&self, _scr_addr: &ScrAddr) -> BTreeMap<TxOutKey, TxIOPair> {
        BTreeMap::new()
    }

    fn tx_hash_for_zc_key(&self, _key: &TxKey) -> Option<Hash256> {
        None
    }
}
