pub mod greylister;
pub mod reader;
pub mod scanner;

pub use greylister::{Broadcast, Greylister};
pub use reader::Reader;
pub use scanner::{ScanEmit, scan_once};

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GreyError {
    #[error(transparent)]
    Db(#[from] greyd_db::DbError),

    #[error(transparent)]
    Frame(#[from] greyd_common::error::FrameError),

    #[error("failed to read permitted domains from {path}: {source}")]
    Domains {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
