//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub type Hash256 = [u8; 32];

pub use block::{Block, BlockDecodeError, BlockHeader, HEADER_SIZE};
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use script::{scr_addr_for_script, ScrAddr};
pub use transaction::{Transaction, TxIn, TxOut};
