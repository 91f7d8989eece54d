use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use ledgerd_chainstate::filter::WalletBatch;
use ledgerd_chainstate::manager::{BlockDataManager, Config};
use ledgerd_chainstate::progress::NullProgress;
use ledgerd_chainstate::ChainError;
use ledgerd_primitives::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use ledgerd_primitives::scr_addr_for_script;
use ledgerd_storage::memory::MemoryStore;

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
    let mut file = OpenOptions::new()
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

#[test]
fn cold_start_applies_two_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_g = p2pkh_script(0xaa);
    let script_a = p2pkh_script(0x11);

    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, script_g.clone())]);
    let genesis_coinbase = genesis.transactions[0].txid();
    let spend = spend_tx(
        OutPoint {
            hash: genesis_coinbase,
            index: 0,
        },
        COINBASE_VALUE,
        script_a.clone(),
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
    let manager =
        Arc::new(BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"));

    let scr_a = scr_addr_for_script(&script_a).expect("scr addr");
    let handle = Arc::clone(&manager)
        .register_addresses(WalletBatch {
            wallet_id: "W".to_string(),
            scr_addrs: vec![scr_a],
            is_new: true,
        })
        .expect("register");
    assert_eq!(handle.try_done(), Some(true));

    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");

    assert_eq!(manager.top_block_height(), 1);
    let info = manager.db_info().expect("dbinfo");
    assert_eq!(info.applied_to_height, 1);
    assert_eq!(info.top_blk_hash, block1.header.hash());
    assert_eq!(info.top_scanned_blk_hash, block1.header.hash());

    let summary = manager.ssh_summary(&scr_a).expect("ssh").expect("ssh row");
    assert_eq!(summary.total_received, COINBASE_VALUE);
    assert_eq!(summary.total_unspent, COINBASE_VALUE);
    assert_eq!(summary.total_txio_count, 1);
    assert_eq!(
        manager.addr_full_balance(&scr_a).expect("balance"),
        (COINBASE_VALUE, 1)
    );

    // The genesis coinbase output is marked spent by the block-1 spender.
    let stxo = manager
        .stored_tx_out(0, 0, 0)
        .expect("stxo")
        .expect("stxo row");
    assert!(stxo.is_spent());
    let (spender, spender_txid) = manager
        .spender_tx_for_tx_out(0, 0, 0)
        .expect("spender")
        .expect("spender tx");
    assert_eq!(spender_txid, spend.txid());
    assert_eq!(spender.vin[0].prevout.hash, genesis_coinbase);

    assert!(manager.missing_block_hashes().is_empty());
}

#[test]
fn framing_resync_skips_garbage_and_keeps_both_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    let block1 = make_block(
        genesis.header.hash(),
        T0 + 600,
        1,
        vec![coinbase_tx(1, p2pkh_script(0xbb))],
    );

    let genesis_frame = frame(&genesis);
    let block1_frame = frame(&block1);
    let mut contents = genesis_frame.clone();
    contents.extend_from_slice(&[0x55u8; 37]);
    contents.extend_from_slice(&block1_frame);
    contents.extend_from_slice(&[0u8; 64]);
    write_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager =
        Arc::new(BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"));
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");

    assert_eq!(manager.top_block_height(), 1);
    assert!(manager.has_header_with_hash(&block1.header.hash()));
    assert_eq!(
        manager.end_of_last_block_byte(),
        (genesis_frame.len() + 37 + block1_frame.len()) as u64
    );
}

#[test]
fn incremental_update_and_file_split() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    write_file(dir.path(), 0, &frame(&genesis));

    let store = Arc::new(MemoryStore::new());
    let manager =
        Arc::new(BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"));
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");
    assert_eq!(manager.top_block_height(), 0);

    // The node appends a block to the tracked file.
    let block1 = make_block(
        genesis.header.hash(),
        T0 + 600,
        1,
        vec![coinbase_tx(1, p2pkh_script(0xbb))],
    );
    append_file(dir.path(), 0, &frame(&block1));
    let update = manager.read_blk_file_update().expect("update");
    assert_eq!(update.prev_top_height, 0);
    assert_eq!(update.new_top_height, 1);
    assert_eq!(update.blocks_read, 1);
    assert!(update.reorg.is_none());
    assert!(update
        .mined_tx_hashes
        .contains(&block1.transactions[0].txid()));

    // Then it splits into a fresh file.
    let block2 = make_block(
        block1.header.hash(),
        T0 + 1200,
        2,
        vec![coinbase_tx(2, p2pkh_script(0xcc))],
    );
    write_file(dir.path(), 1, &frame(&block2));
    let update = manager.read_blk_file_update().expect("update");
    assert_eq!(update.new_top_height, 2);
    assert_eq!(update.blocks_read, 1);

    // Nothing new: a no-op pass.
    let update = manager.read_blk_file_update().expect("update");
    assert_eq!(update.blocks_read, 0);
    assert_eq!(update.new_top_height, 2);
}

#[test]
fn closest_block_height_for_time_clamps() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    let mut contents = frame(&genesis);
    let mut prev = genesis.header.hash();
    for height in 1u32..=5 {
        let block = make_block(
            prev,
            T0 + height * 600,
            height,
            vec![coinbase_tx(height, p2pkh_script(0xbb))],
        );
        prev = block.header.hash();
        contents.extend_from_slice(&frame(&block));
    }
    write_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager =
        Arc::new(BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"));
    manager
        .do_initial_sync_on_load(&mut NullProgress)
        .expect("initial sync");
    assert_eq!(manager.top_block_height(), 5);

    assert_eq!(manager.closest_block_height_for_time(T0 - 100), 0);
    assert_eq!(manager.closest_block_height_for_time(u32::MAX), 4);
    let mid = manager.closest_block_height_for_time(T0 + 1800);
    assert!(mid <= 3);

    // Genesis timestamp queries clamp to height 0.
    assert_eq!(manager.block_time_by_height(0), Some(T0));
    assert_eq!(manager.block_time_by_height(9999), Some(T0 + 5 * 600));
}

#[test]
fn wrong_network_block_files_abort() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);

    let mut contents = vec![0xde, 0xad, 0xbe, 0xef];
    let payload = genesis.consensus_encode();
    contents.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    contents.extend_from_slice(&payload);
    write_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager =
        Arc::new(BlockDataManager::new(test_config(dir.path(), &genesis), store).expect("manager"));
    assert!(matches!(
        manager.do_initial_sync_on_load(&mut NullProgress),
        Err(ChainError::NetworkMismatch)
    ));
}

#[test]
fn genesis_config_mismatch_on_restart_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = make_block([0u8; 32], T0, 0, vec![coinbase_tx(0, p2pkh_script(0xaa))]);
    write_file(dir.path(), 0, &frame(&genesis));

    let store = Arc::new(MemoryStore::new());
    {
        let manager = BlockDataManager::new(test_config(dir.path(), &genesis), Arc::clone(&store))
            .expect("manager");
        manager
            .do_initial_sync_on_load(&mut NullProgress)
            .expect("initial sync");
    }

    let mut other = test_config(dir.path(), &genesis);
    other.genesis_block_hash = [9u8; 32];
    assert!(matches!(
        BlockDataManager::new(other, store),
        Err(ChainError::NetworkMismatch)
    ));
}
