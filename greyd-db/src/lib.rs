pub mod driver;
pub mod file;
pub mod handle;
pub mod key;
pub mod memory;
mod store;

pub use driver::Driver;
pub use file::FileDriver;
pub use handle::{AddrState, Cursor, Handle, ScanOutcome};
pub use key::{Key, Tuple, Val};
pub use memory::MemoryDriver;

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database is not open")]
    NotOpen,

    #[error("transaction already in progress")]
    NestedTxn,

    #[error("no transaction in progress")]
    NoTxn,

    #[error("lookup-only key cannot be stored")]
    NotStorable,

    #[error("unknown database driver {0:?}")]
    UnknownDriver(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("snapshot serialization failed: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
