//! Stored transaction output rows.

use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};
use ledgerd_primitives::Hash256;

use crate::keys::TxInKey;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredTxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    pub is_coinbase: bool,
    pub spent_by: Option<TxInKey>,
}

impl StoredTxOut {
    pub fn is_spent(&self) -> bool {
        self.spent_by.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        match &self.spent_by {
            Some(key) => {
                encoder.write_u8(1);
                encoder.write_bytes(key.as_bytes());
            }
            None => encoder.write_u8(0),
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_u64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let is_coinbase = decoder.read_u8()? != 0;
        let spent_by = if decoder.read_u8()? != 0 {
            let key_bytes = decoder.read_fixed::<8>()?;
            Some(
                TxInKey::from_slice(&key_bytes)
                    .ok_or(DecodeError::InvalidData("invalid spender key"))?,
            )
        } else {
            None
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            is_coinbase,
            spent_by,
        })
    }
}

/// Query result for unspent-output lookups.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnspentTxOut {
    pub tx_hash: Hash256,
    pub tx_out_index: u32,
    pub height: u32,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}
