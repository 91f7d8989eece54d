use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ledgerd_chainstate::filter::WalletBatch;
use ledgerd_chainstate::keys::{hgtx, TxInKey, TxKey, TxOutKey};
use ledgerd_chainstate::manager::{BlockDataManager, Config};
use ledgerd_chainstate::progress::NullProgress;
use ledgerd_chainstate::ssh::TxIOPair;
use ledgerd_primitives::{
    scr_addr_for_script, Block, BlockHeader, Hash256, OutPoint, ScrAddr, Transaction, TxIn, TxOut,
};
use ledgerd_storage::memory::MemoryStore;
use ledgerd_view::notify::Notification;
use ledgerd_view::viewer::BlockDataViewer;
use ledgerd_view::zeroconf::{ZcPacket, ZcPurgePacket, ZeroConfSource};

const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];
const BITS: u32 = 0x207fffff;
const COINBASE_VALUE: u64 = 50_0000_0000;
const T0: u32 = 1_500_000_000;

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn make_tx(vin: Vec<TxIn>, vout: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        vin,
        vout,
        lock_time: 0,
    }
}

fn coinbase_tx(height: u32, script_pubkey: Vec<u8>) -> Transaction {
    make_tx(
        vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vec![TxOut {
            value: COINBASE_VALUE,
            script_pubkey,
        }],
    )
}

fn spend_tx(prev: OutPoint, value: u64, script_pubkey: Vec<u8>) -> Transaction {
    make_tx(
        vec![TxIn {
            prevout: prev,
            script_sig: vec![0x01],
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vec![TxOut {
            value,
            script_pubkey,
        }],
    )
}

fn fan_out_tx(prev: OutPoint, outputs: u16, value: u64, script_pubkey: &[u8]) -> Transaction {
    let vout = (0..outputs)
        .map(|_| TxOut {
            value,
            script_pubkey: script_pubkey.to_vec(),
        })
        .collect();
    make_tx(
        vec![TxIn {
            prevout: prev,
            script_sig: vec![0x02],
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout,
    )
}

fn make_block(prev_block: [u8; 32], time: u32, nonce: u32, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 2,
            prev_block,
            merkle_root: [0u8; 32],
            time,
            bits: BITS,
            nonce,
        },
        transactions,
    }
}

fn frame(block: &Block) -> Vec<u8> {
    let payload = block.consensus_encode();
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

fn write_file(dir: &Path, index: u16, contents: &[u8]) {
    std::fs::write(dir.join(format!("blk{index:05}.dat")), contents).expect("write blk file");
}

fn append_file(dir: &Path, index: u16, contents: &[u8]) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(dir.join(format!("blk{index:05}.dat")))
        .expect("open blk file");
    file.write_all(contents).expect("append blk file");
}

fn test_config(dir: &Path, genesis: &Block) -> Config {
    Config {
        blk_file_dir: dir.to_path_buf(),
        magic_bytes: MAGIC,
        genesis_block_hash: genesis.header.hash(),
        genesis_tx_hash: genesis.transactions[0].txid(),
        super_node: false,
        seconds_per_block: 600,
        timestamp_tolerance: 3600,
        update_bytes_thresh: 1 << 20,
    }
}

/// A scriptable stand-in for the mempool provider.
#[derive(Default)]
struct TestZeroConf {
    txs: Mutex<BTreeMap<Hash256, Transaction>>,
    txio_map: Mutex<BTreeMap<ScrAddr, BTreeMap<TxOutKey, TxIOPair>>>,
    hashes: Mutex<BTreeMap<TxKey, Hash256>>,
}

impl TestZeroConf {
    fn clear(&self) {
        self.txs.lock().expect("zc lock").clear();
        self.txio_map.lock().expect("zc lock").clear();
        self.hashes.lock().expect("zc lock").clear();
    }
}

impl ZeroConfSource for TestZeroConf {
    fn get_tx_by_hash(&self, tx_hash: &Hash256) -> Option<Transaction> {
        self.txs.lock().expect("zc lock").get(tx_hash).cloned()
    }

    fn get_full_txio_map(&self) -> BTreeMap<ScrAddr, BTreeMap<TxOutKey, TxIOPair>> {
        self.txio_map.lock().expect("zc lock").clone()
    }

    fn get_unspent_zc_for_scr_addr(&self, scr_addr: &ScrAddr) -> BTreeMap<TxOutKey, TxIOPair> {
        self.txio_map
            .lock()
            .expect("zc lock")
            .get(scr_addr)
            .cloned()
            .unwrap_or_default()
    }

    fn tx_hash_for_zc_key(&self, key: &TxKey) -> Option<Hash256> {
        self.hashes.lock().expect("zc lock").get(key).copied()
    }
}

#[test]
fn cold_start_wallet_history_page() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_a = p2pkh_script(0x11);
    let scr_a = scr_addr_for_script(&script_a).expect("scr a");

    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    let spend = spend_tx(
        OutPoint {
            hash: genesis.transactions[0].txid(),
            index: 0,
        },
        COINBASE_VALUE,
        script_a,
    );
    let block1 = make_block(
        genesis.header.hash(),
        T0 + 600,
        1,
        vec![coinbase_tx(1, p2pkh_script(0xbb)), spend.clone()],
    );

    let mut contents = frame(&genesis);
    contents.extend_from_slice(&frame(&block1));
    write_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(
        BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"),
    );
    let viewer = BlockDataViewer::new(Arc::clone(&manager), Arc::new(TestZeroConf::default()));

    assert!(viewer
        .register_wallet(vec![scr_a], "W", true)
        .expect("register wallet"));
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");

    viewer.scan_wallets(&Notification::Init).expect("init scan");
    assert_eq!(viewer.get_top_block_height(), 1);

    let page = viewer
        .get_wallets_history_page(0, false, false)
        .expect("page 0");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].wallet_id, "W");
    assert_eq!(page[0].value, COINBASE_VALUE as i64);
    assert_eq!(page[0].block_height, 1);
    assert_eq!(page[0].tx_hash, spend.txid());
    assert_eq!(page[0].tx_time, T0 + 600);
}

#[test]
fn zero_conf_entry_then_mined_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_a = p2pkh_script(0x11);
    let scr_a = scr_addr_for_script(&script_a).expect("scr a");

    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    let fund = spend_tx(
        OutPoint {
            hash: genesis.transactions[0].txid(),
            index: 0,
        },
        COINBASE_VALUE,
        script_a.clone(),
    );
    let block1 = make_block(
        genesis.header.hash(),
        T0 + 600,
        1,
        vec![coinbase_tx(1, p2pkh_script(0xbb)), fund.clone()],
    );

    let mut contents = frame(&genesis);
    contents.extend_from_slice(&frame(&block1));
    write_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(
        BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"),
    );
    let zeroconf = Arc::new(TestZeroConf::default());
    let viewer = BlockDataViewer::new(Arc::clone(&manager), Arc::clone(&zeroconf));

    viewer
        .register_wallet(vec![scr_a], "W", true)
        .expect("register wallet");
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");
    viewer.scan_wallets(&Notification::Init).expect("init scan");

    // Unconfirmed tx T spends the wallet's only output.
    let zc_tx = spend_tx(
        OutPoint {
            hash: fund.txid(),
            index: 0,
        },
        COINBASE_VALUE,
        p2pkh_script(0xcc),
    );
    let zc_key = TxKey::zero_conf(0);
    let funded_key = TxOutKey::new(TxKey::new(hgtx(1, 0), 1), 0);
    let mut zc_txio = TxIOPair::new(funded_key, COINBASE_VALUE);
    zc_txio.txin_key = Some(TxInKey::new(zc_key, 0));
    zc_txio.txin_zc = true;

    zeroconf
        .txs
        .lock()
        .expect("zc lock")
        .insert(zc_tx.txid(), zc_tx.clone());
    zeroconf
        .txio_map
        .lock()
        .expect("zc lock")
        .entry(scr_a)
        .or_default()
        .insert(funded_key, zc_txio.clone());
    zeroconf
        .hashes
        .lock()
        .expect("zc lock")
        .insert(zc_key, zc_tx.txid());

    let mut packet = ZcPacket::default();
    packet
        .txio_map
        .entry(scr_a)
        .or_default()
        .insert(funded_key, zc_txio);
    packet.new_zc_keys.insert(zc_key);
    packet.tx_hashes.insert(zc_key, zc_tx.txid());

    let fresh = viewer
        .scan_wallets(&Notification::Zc(packet))
        .expect("zc scan");
    assert_eq!(fresh.len(), 1);
    let zc_entry = fresh.values().next().expect("zc entry");
    assert_eq!(zc_entry.block_height, u32::MAX);
    assert_eq!(zc_entry.value, -(COINBASE_VALUE as i64));

    let page = viewer
        .get_wallets_history_page(0, false, false)
        .expect("page 0");
    assert!(page.iter().any(|entry| {
        entry.tx_hash == zc_tx.txid() && entry.block_height == u32::MAX
    }));

    // The next block mines T.
    let block2 = make_block(
        block1.header.hash(),
        T0 + 1200,
        2,
        vec![coinbase_tx(2, p2pkh_script(0xdd)), zc_tx.clone()],
    );
    append_file(dir.path(), 0, &frame(&block2));
    let update = manager.read_blk_file_update().expect("update");
    assert!(update.mined_tx_hashes.contains(&zc_tx.txid()));
    zeroconf.clear();

    let mut purge = ZcPurgePacket::default();
    purge.mined_txio_keys.insert(zc_key);
    let notification = viewer.new_block_notification(&update, Some(purge));
    viewer.scan_wallets(&notification).expect("new block scan");

    let page = viewer
        .get_wallets_history_page(0, false, false)
        .expect("page 0");
    let mined: Vec<_> = page
        .iter()
        .filter(|entry| entry.tx_hash == zc_tx.txid())
        .collect();
    assert_eq!(mined.len(), 1);
    assert_eq!(mined[0].block_height, 2);
    assert_eq!(mined[0].value, -(COINBASE_VALUE as i64));
}

#[test]
fn pages_partition_the_full_ledger_and_memoize() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_a = p2pkh_script(0x11);
    let scr_a = scr_addr_for_script(&script_a).expect("scr a");
    let per_output: u64 = 1000;

    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    let mut contents = frame(&genesis);
    let mut prev_block = genesis.header.hash();
    let mut prev_out = OutPoint {
        hash: genesis.transactions[0].txid(),
        index: 0,
    };
    let mut expected_tx_hashes = Vec::new();
    for height in 1u32..=4 {
        let fan_out = fan_out_tx(prev_out.clone(), 40, per_output, &script_a);
        expected_tx_hashes.push(fan_out.txid());
        prev_out = OutPoint {
            hash: coinbase_tx(height, p2pkh_script(0xbb)).txid(),
            index: 0,
        };
        let block = make_block(
            prev_block,
            T0 + height * 600,
            height,
            vec![coinbase_tx(height, p2pkh_script(0xbb)), fan_out],
        );
        prev_block = block.header.hash();
        contents.extend_from_slice(&frame(&block));
    }
    write_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(
        BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"),
    );
    let viewer = BlockDataViewer::new(Arc::clone(&manager), Arc::new(TestZeroConf::default()));
    viewer
        .register_wallet(vec![scr_a], "W", true)
        .expect("register wallet");
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");

    let id_before = viewer.update_id();
    viewer.scan_wallets(&Notification::Init).expect("init scan");
    assert!(viewer.update_id() > id_before);

    // 40 TxIOs at each of four heights: two pages.
    assert_eq!(viewer.get_wallets_page_count(), 2);

    let page0 = viewer
        .get_wallets_history_page(0, false, false)
        .expect("page 0");
    let page1 = viewer
        .get_wallets_history_page(1, false, false)
        .expect("page 1");

    // Concatenated pages equal the full sorted ledger.
    let mut concatenated = page0.clone();
    concatenated.extend(page1.clone());
    assert_eq!(concatenated.len(), 4);
    for window in concatenated.windows(2) {
        assert!(window[0].key() > window[1].key());
    }
    for (index, entry) in concatenated.iter().enumerate() {
        assert_eq!(entry.block_height, 4 - index as u32);
        assert_eq!(entry.value, 40 * per_output as i64);
        assert_eq!(entry.tx_hash, expected_tx_hashes[3 - index]);
    }

    // Same (pageId, updateID) pair yields an identical page.
    let page0_again = viewer
        .get_wallets_history_page(0, false, false)
        .expect("page 0 again");
    assert_eq!(page0, page0_again);

    // Delegate lookups agree with the pager.
    let delegate = viewer.get_ledger_delegate_for_wallets();
    assert_eq!(delegate.get_page_id_for_block_height(1).expect("page id"), 1);
    assert_eq!(delegate.get_page_id_for_block_height(4).expect("page id"), 0);
    assert_eq!(delegate.get_page(1).expect("page").len(), 1);
}
