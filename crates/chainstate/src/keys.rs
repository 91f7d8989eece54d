//! Composite keys for the index rows.
//!
//! Every row keyed by chain position starts with `hgtx`, the height packed
//! with the per-height duplicate ID: `(height << 8) | dup`. Keys are
//! big-endian so prefix scans walk in height order. Heights are bounded by
//! 2^24 - 1 and duplicate IDs by 255.

use ledgerd_primitives::ScrAddr;

/// Sentinel hgtx for zero-confirmation rows. Sorts after every block row
/// and is preserved as the `u32::MAX` height on external interfaces.
pub const ZC_HGTX: u32 = u32::MAX;

pub const TX_KEY_LEN: usize = 6;
pub const TXIO_KEY_LEN: usize = 8;
pub const SUB_HIST_KEY_LEN: usize = 25;

pub fn hgtx(height: u32, duplicate_id: u8) -> u32 {
    debug_assert!(height < (1 << 24));
    (height << 8) | duplicate_id as u32
}

pub fn hgtx_height(hgtx: u32) -> u32 {
    if hgtx == ZC_HGTX {
        u32::MAX
    } else {
        hgtx >> 8
    }
}

pub fn hgtx_duplicate_id(hgtx: u32) -> u8 {
    (hgtx & 0xff) as u8
}

pub fn hgtx_key(hgtx: u32) -> [u8; 4] {
    hgtx.to_be_bytes()
}

/// Locator of a transaction: hgtx plus the index within its block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TxKey([u8; TX_KEY_LEN]);

impl TxKey {
    pub fn new(hgtx: u32, tx_index: u16) -> Self {
        let mut bytes = [0u8; TX_KEY_LEN];
        bytes[..4].copy_from_slice(&hgtx.to_be_bytes());
        bytes[4..].copy_from_slice(&tx_index.to_be_bytes());
        Self(bytes)
    }

    pub fn zero_conf(counter: u16) -> Self {
        Self::new(ZC_HGTX, counter)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_KEY_LEN {
            return None;
        }
        let mut out = [0u8; TX_KEY_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn hgtx(&self) -> u32 {
        u32::from_be_bytes(self.0[..4].try_into().expect("tx key hgtx"))
    }

    pub fn height(&self) -> u32 {
        hgtx_height(self.hgtx())
    }

    pub fn duplicate_id(&self) -> u8 {
        hgtx_duplicate_id(self.hgtx())
    }

    pub fn tx_index(&self) -> u16 {
        u16::from_be_bytes(self.0[4..].try_into().expect("tx key index"))
    }

    pub fn is_zero_conf(&self) -> bool {
        self.hgtx() == ZC_HGTX
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Locator of a transaction output.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TxOutKey([u8; TXIO_KEY_LEN]);

impl TxOutKey {
    pub fn new(tx_key: TxKey, out_index: u16) -> Self {
        let mut bytes = [0u8; TXIO_KEY_LEN];
        bytes[..TX_KEY_LEN].copy_from_slice(tx_key.as_bytes());
        bytes[TX_KEY_LEN..].copy_from_slice(&out_index.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TXIO_KEY_LEN {
            return None;
        }
        let mut out = [0u8; TXIO_KEY_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn tx_key(&self) -> TxKey {
        TxKey::from_slice(&self.0[..TX_KEY_LEN]).expect("txout key prefix")
    }

    pub fn out_index(&self) -> u16 {
        u16::from_be_bytes(self.0[TX_KEY_LEN..].try_into().expect("txout key index"))
    }

    pub fn is_zero_conf(&self) -> bool {
        self.tx_key().is_zero_conf()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Locator of a transaction input.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TxInKey([u8; TXIO_KEY_LEN]);

impl TxInKey {
    pub fn new(tx_key: TxKey, in_index: u16) -> Self {
        let mut bytes = [0u8; TXIO_KEY_LEN];
        bytes[..TX_KEY_LEN].copy_from_slice(tx_key.as_bytes());
        bytes[TX_KEY_LEN..].copy_from_slice(&in_index.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TXIO_KEY_LEN {
            return None;
        }
        let mut out = [0u8; TXIO_KEY_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn tx_key(&self) -> TxKey {
        TxKey::from_slice(&self.0[..TX_KEY_LEN]).expect("txin key prefix")
    }

    pub fn in_index(&self) -> u16 {
        u16::from_be_bytes(self.0[TX_KEY_LEN..].try_into().expect("txin key index"))
    }

    pub fn is_zero_conf(&self) -> bool {
        self.tx_key().is_zero_conf()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// SubHist row key: script address followed by the block's hgtx.
pub fn sub_hist_key(scr_addr: &ScrAddr, hgtx: u32) -> [u8; SUB_HIST_KEY_LEN] {
    let mut key = [0u8; SUB_HIST_KEY_LEN];
    key[..21].copy_from_slice(scr_addr.as_bytes());
    key[21..].copy_from_slice(&hgtx.to_be_bytes());
    key
}

pub fn parse_sub_hist_key(key: &[u8]) -> Option<(ScrAddr, u32)> {
    if key.len() != SUB_HIST_KEY_LEN {
        return None;
    }
    let scr_addr = ScrAddr::from_slice(&key[..21])?;
    let hgtx = u32::from_be_bytes(key[21..].try_into().ok()?);
    Some((scr_addr, hgtx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hgtx_packs_height_and_dup() {
        let packed = hgtx(0x00ab_cdef, 3);
        assert_eq!(hgtx_height(packed), 0x00ab_cdef);
        assert_eq!(hgtx_duplicate_id(packed), 3);
    }

    #[test]
    fn keys_sort_by_height_then_index() {
        let a = TxOutKey::new(TxKey::new(hgtx(10, 0), 0), 0);
        let b = TxOutKey::new(TxKey::new(hgtx(10, 0), 1), 0);
        let c = TxOutKey::new(TxKey::new(hgtx(11, 0), 0), 0);
        let zc = TxOutKey::new(TxKey::zero_conf(0), 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < zc);
    }

    #[test]
    fn zero_conf_sentinel_round_trips() {
        let key = TxKey::zero_conf(7);
        assert!(key.is_zero_conf());
        assert_eq!(key.height(), u32::MAX);
        assert_eq!(key.tx_index(), 7);
    }
}
