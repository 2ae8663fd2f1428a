pub mod addr;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipe;

pub use tracing;

/// Broadcast control signal shared by the long-running tasks.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Reload,
}
