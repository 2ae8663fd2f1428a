//! The storage back-end contract.
//!
//! Each driver is a value implementing this operation set; selection is by
//! the `database.driver` configuration key and drivers are linked
//! statically. A handle has at most one writer; callers serialise access
//! externally.

use greyd_common::config::DatabaseConfig;

use crate::key::{Key, Val};
use crate::{DbError, FileDriver, MemoryDriver};

pub trait Driver: Send + std::fmt::Debug {
    /// Open the backing storage. Opening an already-open driver is a no-op.
    fn open(&mut self) -> Result<(), DbError>;

    fn close(&mut self);

    /// Begin a serialisable transaction. Nesting is forbidden.
    fn start_txn(&mut self) -> Result<(), DbError>;

    fn commit_txn(&mut self) -> Result<(), DbError>;

    fn rollback_txn(&mut self) -> Result<(), DbError>;

    /// Upsert into the namespace implied by the key type.
    fn put(&mut self, key: &Key, val: &Val) -> Result<(), DbError>;

    fn get(&mut self, key: &Key) -> Result<Option<Val>, DbError>;

    /// Remove a record; reports whether it existed.
    fn del(&mut self, key: &Key) -> Result<bool, DbError>;

    /// Snapshot of every record in the selected namespaces, in key order.
    fn entries(&self, namespaces: u8) -> Result<Vec<(Key, Val)>, DbError>;
}

/// Instantiate the configured driver.
pub fn from_config(config: &DatabaseConfig) -> Result<Box<dyn Driver>, DbError> {
    match config.driver.as_str() {
        "memory" => Ok(Box::new(MemoryDriver::new())),
        "file" => Ok(Box::new(FileDriver::new(
            config.path.join(&config.db_name),
        ))),
        other => Err(DbError::UnknownDriver(other.to_string())),
    }
}
