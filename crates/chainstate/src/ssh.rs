//! Stored script history: the per-address summary row plus per-block
//! sub-history buckets of TxIO pairs.

use std::collections::BTreeMap;

use ledgerd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::keys::{TxInKey, TxOutKey};

const TXIO_FLAG_FROM_COINBASE: u8 = 1 << 0;
const TXIO_FLAG_MULTISIG: u8 = 1 << 1;
const TXIO_FLAG_TXOUT_ZC: u8 = 1 << 2;
const TXIO_FLAG_TXIN_ZC: u8 = 1 << 3;

/// An output observed for a script address, paired with the input that
/// spent it once that input is observed. Created once, mutated in place.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIOPair {
    pub txout_key: TxOutKey,
    pub txin_key: Option<TxInKey>,
    pub value: u64,
    pub is_from_coinbase: bool,
    pub is_multisig: bool,
    pub txout_zc: bool,
    pub txin_zc: bool,
}

impl TxIOPair {
    pub fn new(txout_key: TxOutKey, value: u64) -> Self {
        Self {
            txout_key,
            txin_key: None,
            value,
            is_from_coinbase: false,
            is_multisig: false,
            txout_zc: false,
            txin_zc: false,
        }
    }

    pub fn is_spent(&self) -> bool {
        self.txin_key.is_some()
    }

    pub fn has_txout_zc(&self) -> bool {
        self.txout_zc
    }

    pub fn has_txin_zc(&self) -> bool {
        self.txin_zc
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        let mut flags = 0u8;
        if self.is_from_coinbase {
            flags |= TXIO_FLAG_FROM_COINBASE;
        }
        if self.is_multisig {
            flags |= TXIO_FLAG_MULTISIG;
        }
        if self.txout_zc {
            flags |= TXIO_FLAG_TXOUT_ZC;
        }
        if self.txin_zc {
            flags |= TXIO_FLAG_TXIN_ZC;
        }
        encoder.write_u8(flags);
        encoder.write_bytes(self.txout_key.as_bytes());
        encoder.write_u64_le(self.value);
        match &self.txin_key {
            Some(key) => {
                encoder.write_u8(1);
                encoder.write_bytes(key.as_bytes());
            }
            None => encoder.write_u8(0),
        }
    }

    pub fn decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let flags = decoder.read_u8()?;
        let txout_bytes = decoder.read_fixed::<8>()?;
        let txout_key = TxOutKey::from_slice(&txout_bytes)
            .ok_or(DecodeError::InvalidData("invalid txout key"))?;
        let value = decoder.read_u64_le()?;
        let txin_key = if decoder.read_u8()? != 0 {
            let txin_bytes = decoder.read_fixed::<8>()?;
            Some(
                TxInKey::from_slice(&txin_bytes)
                    .ok_or(DecodeError::InvalidData("invalid txin key"))?,
            )
        } else {
            None
        };
        Ok(Self {
            txout_key,
            txin_key,
            value,
            is_from_coinbase: flags & TXIO_FLAG_FROM_COINBASE != 0,
            is_multisig: flags & TXIO_FLAG_MULTISIG != 0,
            txout_zc: flags & TXIO_FLAG_TXOUT_ZC != 0,
            txin_zc: flags & TXIO_FLAG_TXIN_ZC != 0,
        })
    }
}

/// One SubHist bucket: every TxIO a script address saw in one block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoredSubHistory {
    pub txio: BTreeMap<TxOutKey, TxIOPair>,
}

impl StoredSubHistory {
    pub fn is_empty(&self) -> bool {
        self.txio.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.txio.len() as u64);
        for txio in self.txio.values() {
            txio.encode(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()? as usize;
        let mut txio = BTreeMap::new();
        for _ in 0..count {
            let pair = TxIOPair::decode(&mut decoder)?;
            txio.insert(pair.txout_key, pair);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txio })
    }
}

/// The SSH summary row for one script address.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoredScriptHistory {
    pub scanned_up_to: u32,
    pub total_txio_count: u64,
    pub total_received: u64,
    pub total_unspent: u64,
}

impl StoredScriptHistory {
    pub fn balance(&self) -> u64 {
        self.total_unspent
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.scanned_up_to);
        encoder.write_u64_le(self.total_txio_count);
        encoder.write_u64_le(self.total_received);
        encoder.write_u64_le(self.total_unspent);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let scanned_up_to = decoder.read_u32_le()?;
        let total_txio_count = decoder.read_u64_le()?;
        let total_received = decoder.read_u64_le()?;
        let total_unspent = decoder.read_u64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            scanned_up_to,
            total_txio_count,
            total_received,
            total_unspent,
        })
    }
}
