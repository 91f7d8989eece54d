//! Bitcoin transaction types and wire serialization.
//!
//! Witness data is parsed (post-segwit block files carry it) but the txid
//! is always computed over the legacy serialization.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn is_coinbase(&self) -> bool {
        self.prevout.is_null()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].is_coinbase()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    /// Whether any input signals BIP-125 opt-in replaceability.
    pub fn is_rbf(&self) -> bool {
        self.vin.iter().any(|input| input.sequence < 0xffff_fffe)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_legacy())
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        if self.has_witness() {
            self.encode_witness()
        } else {
            self.encode_legacy()
        }
    }

    fn encode_legacy(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.consensus_encode(&mut encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_u64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    fn encode_witness(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_u8(0x00);
        encoder.write_u8(0x01);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.consensus_encode(&mut encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_u64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        for input in &self.vin {
            encoder.write_varint(input.witness.len() as u64);
            for item in &input.witness {
                encoder.write_var_bytes(item);
            }
        }
        encoder.write_u32_le(self.lock_time);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;

        let mut vin_count = decoder.read_varint()?;
        let mut segwit = false;
        if vin_count == 0 {
            // Marker byte; flag must follow.
            let flag = decoder.read_u8()?;
            if flag != 0x01 {
                return Err(DecodeError::InvalidData("invalid segwit flag"));
            }
            segwit = true;
            vin_count = decoder.read_varint()?;
        }
        if vin_count == 0 {
            return Err(DecodeError::InvalidData("transaction has no inputs"));
        }

        let vin_count = usize::try_from(vin_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut vin = Vec::with_capacity(vin_count);
        for _ in 0..vin_count {
            let prevout = OutPoint::consensus_decode(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            vin.push(TxIn {
                prevout,
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }

        let vout_count = decoder.read_varint()?;
        let vout_count = usize::try_from(vout_count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut vout = Vec::with_capacity(vout_count);
        for _ in 0..vout_count {
            let value = decoder.read_u64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            vout.push(TxOut {
                value,
                script_pubkey,
            });
        }

        if segwit {
            for input in vin.iter_mut() {
                let item_count = decoder.read_varint()?;
                let item_count =
                    usize::try_from(item_count).map_err(|_| DecodeError::SizeTooLarge)?;
                let mut witness = Vec::with_capacity(item_count);
                for _ in 0..item_count {
                    witness.push(decoder.read_var_bytes()?);
                }
                input.witness = witness;
            }
        }

        let lock_time = decoder.read_u32_le()?;

        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}
