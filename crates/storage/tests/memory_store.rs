use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::{delete_prefix_batched, Column, KeyValueStore, WriteBatch};

#[test]
fn batch_is_applied_atomically_in_order() {
    let store = MemoryStore::new();

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"a".as_slice(), b"1".as_slice());
    batch.put(Column::Meta, b"a".as_slice(), b"2".as_slice());
    batch.delete(Column::Meta, b"missing".as_slice());
    store.write_batch(&batch).expect("write batch");

    assert_eq!(
        store.get(Column::Meta, b"a").expect("get"),
        Some(b"2".to_vec())
    );
}

#[test]
fn prefix_scan_is_ordered_and_column_scoped() {
    let store = MemoryStore::new();
    store.put(Column::Stxo, &[1, 0, 2], b"c").expect("put");
    store.put(Column::Stxo, &[1, 0, 1], b"b").expect("put");
    store.put(Column::Stxo, &[1, 0, 0], b"a").expect("put");
    store.put(Column::Stxo, &[2, 0, 0], b"x").expect("put");
    store.put(Column::SubHist, &[1, 0, 0], b"y").expect("put");

    let rows = store.scan_prefix(Column::Stxo, &[1, 0]).expect("scan");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].0, vec![1, 0, 0]);
    assert_eq!(rows[2].0, vec![1, 0, 2]);
}

#[test]
fn delete_prefix_batched_respects_cap_and_finishes() {
    let store = MemoryStore::new();
    for i in 0u16..25 {
        let mut key = vec![9u8];
        key.extend_from_slice(&i.to_be_bytes());
        store.put(Column::SubHist, &key, b"v").expect("put");
    }
    store.put(Column::SubHist, &[8, 0], b"keep").expect("put");

    let deleted = delete_prefix_batched(&store, Column::SubHist, &[9], 10).expect("delete");
    assert_eq!(deleted, 25);
    assert!(store.scan_prefix(Column::SubHist, &[9]).expect("scan").is_empty());
    assert_eq!(
        store.get(Column::SubHist, &[8, 0]).expect("get"),
        Some(b"keep".to_vec())
    );
}

#[test]
fn approx_bytes_tracks_payload() {
    let mut batch = WriteBatch::new();
    batch.put(Column::BlkData, vec![0u8; 10], vec![0u8; 90]);
    batch.delete(Column::BlkData, vec![0u8; 10]);
    assert_eq!(batch.approx_bytes(), 110);
}
