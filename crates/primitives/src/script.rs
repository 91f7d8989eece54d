//! Output script classification and script-address derivation.
//!
//! A script address is the 21-byte key the history index is organized by:
//! a 1-byte type prefix followed by a 20-byte hash. P2PK outputs are
//! normalized to the P2PKH form so both spellings of the same key share one
//! history row.

use crate::hash::hash160;

pub const SCRADDR_LEN: usize = 21;

pub const PREFIX_P2PKH: u8 = 0x00;
pub const PREFIX_P2SH: u8 = 0x05;
pub const PREFIX_P2WPKH: u8 = 0x90;
pub const PREFIX_P2WSH: u8 = 0x95;
pub const PREFIX_MULTISIG: u8 = 0xfe;
pub const PREFIX_NONSTD: u8 = 0xff;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    P2Wpkh,
    P2Wsh,
    Multisig,
    NonStandard,
}

const OP_0: u8 = 0x00;
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ScrAddr([u8; SCRADDR_LEN]);

impl ScrAddr {
    pub fn new(prefix: u8, payload: [u8; 20]) -> Self {
        let mut bytes = [0u8; SCRADDR_LEN];
        bytes[0] = prefix;
        bytes[1..].copy_from_slice(&payload);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SCRADDR_LEN {
            return None;
        }
        let mut out = [0u8; SCRADDR_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn prefix(&self) -> u8 {
        self.0[0]
    }
}

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2wpkh(script) {
        ScriptType::P2Wpkh
    } else if is_p2wsh(script) {
        ScriptType::P2Wsh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else if is_multisig(script) {
        ScriptType::Multisig
    } else {
        ScriptType::NonStandard
    }
}

/// Derive the script address an output script is indexed under.
///
/// Empty and OP_RETURN scripts carry no claimable value and yield `None`.
pub fn scr_addr_for_script(script: &[u8]) -> Option<ScrAddr> {
    match classify_script_pubkey(script) {
        ScriptType::P2Pkh => {
            let mut payload = [0u8; 20];
            payload.copy_from_slice(&script[3..23]);
            Some(ScrAddr::new(PREFIX_P2PKH, payload))
        }
        ScriptType::P2Pk => {
            let key_len = script[0] as usize;
            let pubkey = &script[1..1 + key_len];
            Some(ScrAddr::new(PREFIX_P2PKH, hash160(pubkey)))
        }
        ScriptType::P2Sh => {
            let mut payload = [0u8; 20];
            payload.copy_from_slice(&script[2..22]);
            Some(ScrAddr::new(PREFIX_P2SH, payload))
        }
        ScriptType::P2Wpkh => {
            let mut payload = [0u8; 20];
            payload.copy_from_slice(&script[2..22]);
            Some(ScrAddr::new(PREFIX_P2WPKH, payload))
        }
        ScriptType::P2Wsh => Some(ScrAddr::new(PREFIX_P2WSH, hash160(&script[2..34]))),
        ScriptType::Multisig => Some(ScrAddr::new(PREFIX_MULTISIG, hash160(script))),
        ScriptType::NonStandard => {
            if script.is_empty() || script[0] == 0x6a {
                return None;
            }
            Some(ScrAddr::new(PREFIX_NONSTD, hash160(script)))
        }
    }
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2wpkh(script: &[u8]) -> bool {
    script.len() == 22 && script[0] == OP_0 && script[1] == 0x14
}

fn is_p2wsh(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_0 && script[1] == 0x20
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

fn is_multisig(script: &[u8]) -> bool {
    if script.len() < 4 {
        return false;
    }
    let first = script[0];
    let last = script[script.len() - 1];
    let count = script[script.len() - 2];
    (OP_1..=OP_16).contains(&first)
        && (OP_1..=OP_16).contains(&count)
        && last == OP_CHECKMULTISIG
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh_script(tag: u8) -> Vec<u8> {
        let mut script = Vec::with_capacity(25);
        script.extend_from_slice(&[OP_DUP, OP_HASH160, 0x14]);
        script.extend_from_slice(&[tag; 20]);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn p2pkh_address() {
        let scr = scr_addr_for_script(&p2pkh_script(0x11)).expect("scr addr");
        assert_eq!(scr.prefix(), PREFIX_P2PKH);
        assert_eq!(&scr.as_bytes()[1..], &[0x11; 20]);
    }

    #[test]
    fn p2pk_normalizes_to_p2pkh() {
        let pubkey = [0x02u8; 33];
        let mut p2pk = vec![33u8];
        p2pk.extend_from_slice(&pubkey);
        p2pk.push(OP_CHECKSIG);

        let mut p2pkh = vec![OP_DUP, OP_HASH160, 0x14];
        p2pkh.extend_from_slice(&hash160(&pubkey));
        p2pkh.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);

        assert_eq!(
            scr_addr_for_script(&p2pk).expect("p2pk"),
            scr_addr_for_script(&p2pkh).expect("p2pkh")
        );
    }

    #[test]
    fn op_return_is_unindexed() {
        assert_eq!(scr_addr_for_script(&[0x6a, 0x04, 1, 2, 3, 4]), None);
        assert_eq!(scr_addr_for_script(&[]), None);
    }

    #[test]
    fn multisig_gets_own_prefix() {
        // 1-of-2 bare multisig
        let mut script = vec![OP_1];
        for _ in 0..2 {
            script.push(33);
            script.extend_from_slice(&[0x03; 33]);
        }
        script.push(0x52);
        script.push(OP_CHECKMULTISIG);
        let scr = scr_addr_for_script(&script).expect("scr addr");
        assert_eq!(scr.prefix(), PREFIX_MULTISIG);
    }
}
