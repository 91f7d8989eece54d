//! The DBINFO row: network binding plus ingest/scan high-water marks.

use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::Hash256;
use ledgerd_storage::{Column, KeyValueStore, WriteBatch};

use crate::ChainError;

pub const DBINFO_KEY: &[u8] = b"dbinfo";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredDbInfo {
    pub magic_bytes: [u8; 4],
    pub genesis_block_hash: Hash256,
    pub top_blk_height: u32,
    pub top_blk_hash: Hash256,
    pub top_scanned_blk_hash: Hash256,
    pub applied_to_height: u32,
}

impl StoredDbInfo {
    pub fn fresh(magic_bytes: [u8; 4], genesis_block_hash: Hash256) -> Self {
        Self {
            magic_bytes,
            genesis_block_hash,
            top_blk_height: 0,
            top_blk_hash: [0u8; 32],
            top_scanned_blk_hash: [0u8; 32],
            applied_to_height: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.magic_bytes);
        encoder.write_hash_le(&self.genesis_block_hash);
        encoder.write_u32_le(self.top_blk_height);
        encoder.write_hash_le(&self.top_blk_hash);
        encoder.write_hash_le(&self.top_scanned_blk_hash);
        encoder.write_u32_le(self.applied_to_height);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let magic_bytes = decoder.read_fixed::<4>()?;
        let genesis_block_hash = decoder.read_hash_le()?;
        let top_blk_height = decoder.read_u32_le()?;
        let top_blk_hash = decoder.read_hash_le()?;
        let top_scanned_blk_hash = decoder.read_hash_le()?;
        let applied_to_height = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            magic_bytes,
            genesis_block_hash,
            top_blk_height,
            top_blk_hash,
            top_scanned_blk_hash,
            applied_to_height,
        })
    }

    pub fn load<S: KeyValueStore>(store: &S) -> Result<Option<Self>, ChainError> {
        match store.get(Column::Meta, DBINFO_KEY)? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch) {
        batch.put(Column::Meta, DBINFO_KEY, self.encode());
    }
}
