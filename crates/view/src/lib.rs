//! Wallet registry, ledger paging, zero-conf overlay and the viewer
//! façade the query layer talks to.

pub mod group;
pub mod ledger;
pub mod notify;
pub mod pager;
pub mod viewer;
pub mod wallet;
pub mod zeroconf;

use ledgerd_chainstate::ChainError;

#[derive(Debug)]
pub enum ViewError {
    Chain(ChainError),
    UnknownWallet,
    PageOutOfRange,
    UnknownScrAddr,
}

impl std::fmt::Display for ViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewError::Chain(err) => write!(f, "{err}"),
            ViewError::UnknownWallet => write!(f, "unregistered wallet ID"),
            ViewError::PageOutOfRange => write!(f, "page id out of range"),
            ViewError::UnknownScrAddr => write!(f, "script address is not tracked"),
        }
    }
}

impl std::error::Error for ViewError {}

impl From<ChainError> for ViewError {
    fn from(err: ChainError) -> Self {
        ViewError::Chain(err)
    }
}
