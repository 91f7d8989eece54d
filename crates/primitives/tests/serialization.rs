use ledgerd_primitives::encoding::{Decoder, Encoder};
use ledgerd_primitives::{sha256d, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

#[test]
fn varint_round_trip_boundaries() {
    for value in [
        0u64,
        1,
        0xfc,
        0xfd,
        0xffff,
        0x1_0000,
        0x1f_ffff,
        0x0200_0000,
    ] {
        let mut encoder = Encoder::new();
        encoder.write_varint(value);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_varint().expect("varint"), value);
        assert!(decoder.is_empty());
    }
}

#[test]
fn non_canonical_varint_rejected() {
    // 0xfd prefix carrying a value that fits in one byte
    let bytes = [0xfdu8, 0x10, 0x00];
    let mut decoder = Decoder::new(&bytes);
    assert!(decoder.read_varint().is_err());
}

#[test]
fn header_hash_matches_manual_double_sha() {
    let header = BlockHeader {
        version: 1,
        prev_block: [3u8; 32],
        merkle_root: [4u8; 32],
        time: 1_231_006_505,
        bits: 0x1d00ffff,
        nonce: 2_083_236_893,
    };
    let bytes = header.consensus_encode();
    assert_eq!(header.hash(), sha256d(&bytes));
}

#[test]
fn block_with_two_txs_round_trips() {
    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, 0x02],
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let spend = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: coinbase.txid(),
                index: 0,
            },
            script_sig: vec![0xab],
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value: 49_0000_0000,
            script_pubkey: vec![0x76, 0xa9, 0x14, 0x00, 0x00],
        }],
        lock_time: 0,
    };

    let block = Block {
        header: BlockHeader {
            version: 2,
            prev_block: [9u8; 32],
            merkle_root: [8u8; 32],
            time: 1_400_000_000,
            bits: 0x207fffff,
            nonce: 7,
        },
        transactions: vec![coinbase.clone(), spend.clone()],
    };

    let bytes = block.consensus_encode();
    let decoded = Block::consensus_decode(&bytes).expect("decode");
    assert_eq!(decoded.transactions.len(), 2);
    assert_eq!(decoded.transactions[0].txid(), coinbase.txid());
    assert_eq!(decoded.transactions[1].txid(), spend.txid());
}
