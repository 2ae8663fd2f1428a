pub mod blacklist;
pub mod registry;
pub mod trie;

pub use blacklist::{Blacklist, Kind};
pub use registry::Registry;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error(transparent)]
    Addr(#[from] greyd_common::error::AddrError),

    #[error("address family mismatch in range ({0} vs {1})")]
    FamilyMismatch(String, String),
}
