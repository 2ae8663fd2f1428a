pub mod engine;
pub mod packet;

pub use engine::SyncEngine;
pub use packet::{AddrKind, SyncRecord};

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("truncated or invalid packet")]
    Truncated,

    #[error("unsupported packet version {0}")]
    BadVersion(u8),

    #[error("unsupported address family {0}")]
    BadAddressFamily(u8),

    #[error("HMAC verification failed")]
    BadHmac,

    #[error("unknown TLV type {0}")]
    UnknownTlv(u16),

    #[error("could not resolve sync host {0:?}")]
    Resolve(String),

    #[error("invalid sync address {0:?}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
