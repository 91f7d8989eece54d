//! Block ingestion, script-history indexing and reorg handling.

pub mod blockfiles;
pub mod dbinfo;
pub mod filter;
pub mod headerchain;
pub mod keys;
pub mod manager;
pub mod progress;
pub mod reorg;
pub mod ssh;
pub mod stxo;
pub mod undo;
pub mod writer;

use ledgerd_primitives::block::BlockDecodeError;
use ledgerd_primitives::encoding::DecodeError;
use ledgerd_storage::StoreError;

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    Decode(DecodeError),
    Io(std::io::Error),
    Corruption(&'static str),
    NetworkMismatch,
    NoBlockFiles,
    MissingGenesis,
    MissingInput,
    MissingHeader,
    MissingBlockData,
    UnknownScrAddr,
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Decode(err) => write!(f, "{err}"),
            ChainError::Io(err) => write!(f, "{err}"),
            ChainError::Corruption(message) => write!(f, "{message}"),
            ChainError::NetworkMismatch => write!(f, "block data is for another network"),
            ChainError::NoBlockFiles => write!(f, "no block files could be found"),
            ChainError::MissingGenesis => write!(f, "genesis block not configured or not found"),
            ChainError::MissingInput => write!(f, "missing referenced prior output"),
            ChainError::MissingHeader => write!(f, "missing header"),
            ChainError::MissingBlockData => write!(f, "missing stored block data"),
            ChainError::UnknownScrAddr => write!(f, "script address is not tracked"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<DecodeError> for ChainError {
    fn from(err: DecodeError) -> Self {
        ChainError::Decode(err)
    }
}

impl From<BlockDecodeError> for ChainError {
    fn from(err: BlockDecodeError) -> Self {
        match err {
            BlockDecodeError::Decode(err) => ChainError::Decode(err),
        }
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Io(err)
    }
}
