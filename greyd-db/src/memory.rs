//! Transient driver. Primarily for tests, also usable where greylist state
//! need not survive a restart.

use crate::DbError;
use crate::driver::Driver;
use crate::key::{Key, Val};
use crate::store::Store;

#[derive(Debug, Default)]
pub struct MemoryDriver {
    store: Store,
    /// Pre-transaction snapshot, restored on rollback.
    saved: Option<Store>,
    opened: bool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.opened { Ok(()) } else { Err(DbError::NotOpen) }
    }
}

impl Driver for MemoryDriver {
    fn open(&mut self) -> Result<(), DbError> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn start_txn(&mut self) -> Result<(), DbError> {
        self.ensure_open()?;
        if self.saved.is_some() {
            return Err(DbError::NestedTxn);
        }
        self.saved = Some(self.store.clone());
        Ok(())
    }

    fn commit_txn(&mut self) -> Result<(), DbError> {
        self.saved.take().map(|_| ()).ok_or(DbError::NoTxn)
    }

    fn rollback_txn(&mut self) -> Result<(), DbError> {
        match self.saved.take() {
            Some(saved) => {
                self.store = saved;
                Ok(())
            }
            None => Err(DbError::NoTxn),
        }
    }

    fn put(&mut self, key: &Key, val: &Val) -> Result<(), DbError> {
        self.ensure_open()?;
        self.store.put(key, val)
    }

    fn get(&mut self, key: &Key) -> Result<Option<Val>, DbError> {
        self.ensure_open()?;
        self.store.get(key)
    }

    fn del(&mut self, key: &Key) -> Result<bool, DbError> {
        self.ensure_open()?;
        Ok(self.store.del(key))
    }

    fn entries(&self, namespaces: u8) -> Result<Vec<(Key, Val)>, DbError> {
        self.ensure_open()?;
        self.store.entries(namespaces)
    }
}
