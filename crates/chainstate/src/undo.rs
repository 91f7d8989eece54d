//! Per-block undo records.

use ledgerd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use ledgerd_primitives::{Hash256, OutPoint};

use crate::keys::TxOutKey;
use crate::stxo::StoredTxOut;

const UNDO_VERSION: u8 = 1;

/// An output this block spent, captured pre-spend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemovedStxo {
    pub outpoint: OutPoint,
    pub key: TxOutKey,
    pub stxo: StoredTxOut,
}

/// An output this block created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddedOutPoint {
    pub outpoint: OutPoint,
    pub key: TxOutKey,
}

/// Everything needed to reverse one applied block without the network.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoredUndoData {
    pub block_hash: Hash256,
    pub height: u32,
    pub duplicate_id: u8,
    pub stxos_removed: Vec<RemovedStxo>,
    pub outpoints_added: Vec<AddedOutPoint>,
}

impl StoredUndoData {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(UNDO_VERSION);
        encoder.write_hash_le(&self.block_hash);
        encoder.write_u32_le(self.height);
        encoder.write_u8(self.duplicate_id);
        encoder.write_u32_le(self.stxos_removed.len() as u32);
        for removed in &self.stxos_removed {
            removed.outpoint.consensus_encode(&mut encoder);
            encoder.write_bytes(removed.key.as_bytes());
            encoder.write_var_bytes(&removed.stxo.encode());
        }
        encoder.write_u32_le(self.outpoints_added.len() as u32);
        for added in &self.outpoints_added {
            added.outpoint.consensus_encode(&mut encoder);
            encoder.write_bytes(added.key.as_bytes());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported undo version"));
        }
        let block_hash = decoder.read_hash_le()?;
        let height = decoder.read_u32_le()?;
        let duplicate_id = decoder.read_u8()?;
        let removed_len = decoder.read_u32_le()? as usize;
        let mut stxos_removed = Vec::with_capacity(removed_len);
        for _ in 0..removed_len {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let key_bytes = decoder.read_fixed::<8>()?;
            let key = TxOutKey::from_slice(&key_bytes)
                .ok_or(DecodeError::InvalidData("invalid txout key in undo"))?;
            let stxo_bytes = decoder.read_var_bytes()?;
            let stxo = StoredTxOut::decode(&stxo_bytes)?;
            stxos_removed.push(RemovedStxo {
                outpoint,
                key,
                stxo,
            });
        }
        let added_len = decoder.read_u32_le()? as usize;
        let mut outpoints_added = Vec::with_capacity(added_len);
        for _ in 0..added_len {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let key_bytes = decoder.read_fixed::<8>()?;
            let key = TxOutKey::from_slice(&key_bytes)
                .ok_or(DecodeError::InvalidData("invalid txout key in undo"))?;
            outpoints_added.push(AddedOutPoint { outpoint, key });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            block_hash,
            height,
            duplicate_id,
            stxos_removed,
            outpoints_added,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{hgtx, TxKey};

    #[test]
    fn undo_round_trip() {
        let sud = StoredUndoData {
            block_hash: [0xaa; 32],
            height: 120,
            duplicate_id: 1,
            stxos_removed: vec![RemovedStxo {
                outpoint: OutPoint {
                    hash: [0x01; 32],
                    index: 2,
                },
                key: TxOutKey::new(TxKey::new(hgtx(100, 0), 3), 2),
                stxo: StoredTxOut {
                    value: 5000,
                    script_pubkey: vec![0x51],
                    is_coinbase: false,
                    spent_by: None,
                },
            }],
            outpoints_added: vec![AddedOutPoint {
                outpoint: OutPoint {
                    hash: [0x02; 32],
                    index: 0,
                },
                key: TxOutKey::new(TxKey::new(hgtx(120, 1), 1), 0),
            }],
        };
        let decoded = StoredUndoData::decode(&sud.encode()).expect("decode");
        assert_eq!(decoded, sud);
    }
}
