use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ledgerd_chainstate::filter::WalletBatch;
use ledgerd_chainstate::manager::{BlockDataManager, Config};
use ledgerd_chainstate::progress::NullProgress;
use ledgerd_primitives::{scr_addr_for_script, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::Column;

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

fn coinbase_tx(height: u32, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value: COINBASE_VALUE,
            script_pubkey,
        }],
        lock_time: 0,
    }
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

fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for condition");
}

#[test]
fn side_scan_backfills_and_merges_without_double_counting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_x = p2pkh_script(0x77);
    let scr_x = scr_addr_for_script(&script_x).expect("scr x");

    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    // Block 1 pays X before X is registered.
    let block1 = make_block(
        genesis.header.hash(),
        T0 + 600,
        1,
        vec![coinbase_tx(1, script_x.clone())],
    );

    let mut contents = frame(&genesis);
    contents.extend_from_slice(&frame(&block1));
    write_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(
        BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"),
    );
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");
    assert_eq!(manager.top_block_height(), 1);
    assert_eq!(manager.ssh_summary(&scr_x).expect("ssh"), None);

    // Register X with pre-existing history: a side scan back-fills it.
    let handle = Arc::clone(&manager)
        .register_addresses(WalletBatch {
            wallet_id: "W".to_string(),
            scr_addrs: vec![scr_x],
            is_new: false,
        })
        .expect("register");
    assert_eq!(handle.try_done(), None);

    wait_until(|| manager.filter().has_pending_merge());
    assert!(!manager.filter().is_registered(&scr_x));

    // Block 2 pays X again and arrives right at the merge window.
    let block2 = make_block(
        block1.header.hash(),
        T0 + 1200,
        2,
        vec![coinbase_tx(2, script_x.clone())],
    );
    append_file(dir.path(), 0, &frame(&block2));

    let update = manager.read_blk_file_update().expect("update");
    assert_eq!(update.new_top_height, 2);
    assert_eq!(handle.try_done(), Some(true));
    assert!(manager.filter().is_registered(&scr_x));

    // Both payments are indexed, each exactly once.
    let summary = manager.ssh_summary(&scr_x).expect("ssh").expect("ssh row");
    assert_eq!(summary.total_txio_count, 2);
    assert_eq!(summary.total_received, 2 * COINBASE_VALUE);
    assert_eq!(summary.total_unspent, 2 * COINBASE_VALUE);

    let txios = manager
        .txios_for_scr_addr(&scr_x, 0, 2)
        .expect("txios");
    assert_eq!(txios.len(), 2);
}

#[test]
fn re_registering_the_same_batch_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_x = p2pkh_script(0x77);
    let scr_x = scr_addr_for_script(&script_x).expect("scr x");

    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    write_file(dir.path(), 0, &frame(&genesis));

    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(
        BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"),
    );
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");

    let batch = WalletBatch {
        wallet_id: "W".to_string(),
        scr_addrs: vec![scr_x],
        is_new: true,
    };
    let first = manager.clone().register_addresses(batch.clone()).expect("register");
    assert_eq!(first.try_done(), Some(true));

    // Second call finds nothing new: completes immediately with no
    // side-scan work.
    let second = manager.clone().register_addresses(batch).expect("register again");
    assert_eq!(second.try_done(), Some(true));
    assert!(!manager.filter().has_pending_merge());
    assert_eq!(manager.filter().num_scr_addrs(), 1);
}

#[test]
fn rebuild_matches_cold_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_a = p2pkh_script(0x11);
    let scr_a = scr_addr_for_script(&script_a).expect("scr a");

    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    let mut contents = frame(&genesis);
    let mut prev = genesis.header.hash();
    for height in 1u32..=3 {
        let block = make_block(
            prev,
            T0 + height * 600,
            height,
            vec![coinbase_tx(height, script_a.clone())],
        );
        prev = block.header.hash();
        contents.extend_from_slice(&frame(&block));
    }
    write_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(
        BlockDataManager::new(test_config(dir.path(), &genesis), Arc::clone(&store))
            .expect("manager"),
    );
    Arc::clone(&manager)
        .register_addresses(WalletBatch {
            wallet_id: "W".to_string(),
            scr_addrs: vec![scr_a],
            is_new: true,
        })
        .expect("register");
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");
    assert_eq!(manager.top_block_height(), 3);

    let before: Vec<_> = Column::ALL
        .iter()
        .map(|column| (*column, store.dump_column(*column)))
        .collect();

    // Forced rebuild: everything cleared, then re-ingested to the same
    // terminal state.
    manager
        .do_initial_sync_on_load_rebuild(&mut NullProgress)
        .expect("rebuild");
    assert_eq!(manager.top_block_height(), 3);

    let after: Vec<_> = Column::ALL
        .iter()
        .map(|column| (*column, store.dump_column(*column)))
        .collect();
    assert_eq!(before, after);

    let summary = manager.ssh_summary(&scr_a).expect("ssh").expect("ssh row");
    assert_eq!(summary.total_txio_count, 3);
}
