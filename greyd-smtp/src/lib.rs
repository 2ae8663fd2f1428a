pub mod con;
pub mod listener;

pub use con::{Con, GreydState, State};
pub use listener::Listener;

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind listener to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    AcceptFailed(io::Error),
}
