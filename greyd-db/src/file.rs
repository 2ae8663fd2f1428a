//! File-backed driver.
//!
//! The whole store is kept in memory and snapshotted to disk on commit (or
//! immediately for non-transactional writes). The snapshot is written to a
//! temporary file and renamed into place so a crash never leaves a torn
//! database behind.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::DbError;
use crate::driver::Driver;
use crate::key::{Key, Val};
use crate::store::Store;

#[derive(Debug)]
pub struct FileDriver {
    path: PathBuf,
    store: Store,
    saved: Option<Store>,
    opened: bool,
}

impl FileDriver {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            store: Store::default(),
            saved: None,
            opened: false,
        }
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.opened { Ok(()) } else { Err(DbError::NotOpen) }
    }

    fn in_txn(&self) -> bool {
        self.saved.is_some()
    }

    fn load(&mut self) -> Result<(), DbError> {
        match fs::read(&self.path) {
            Ok(raw) => {
                let (store, _) =
                    bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                        .map_err(|err| DbError::Snapshot(err.to_string()))?;
                self.store = store;
                debug!(path = %self.path.display(), records = self.store.len(), "database loaded");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn persist(&self) -> Result<(), DbError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = bincode::serde::encode_to_vec(&self.store, bincode::config::standard())
            .map_err(|err| DbError::Snapshot(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Driver for FileDriver {
    fn open(&mut self) -> Result<(), DbError> {
        if self.opened {
            return Ok(());
        }
        self.load()?;
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.opened {
            if let Err(err) = self.persist() {
                tracing::warn!(path = %self.path.display(), %err, "failed to persist database on close");
            }
            self.opened = false;
        }
    }

    fn start_txn(&mut self) -> Result<(), DbError> {
        self.ensure_open()?;
        if self.in_txn() {
            return Err(DbError::NestedTxn);
        }
        self.saved = Some(self.store.clone());
        Ok(())
    }

    fn commit_txn(&mut self) -> Result<(), DbError> {
        if self.saved.take().is_none() {
            return Err(DbError::NoTxn);
        }
        self.persist()
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
        self.store.put(key, val)?;
        if !self.in_txn() {
            self.persist()?;
        }
        Ok(())
    }

    fn get(&mut self, key: &Key) -> Result<Option<Val>, DbError> {
        self.ensure_open()?;
        self.store.get(key)
    }

    fn del(&mut self, key: &Key) -> Result<bool, DbError> {
        self.ensure_open()?;
        let found = self.store.del(key);
        if found && !self.in_txn() {
            self.persist()?;
        }
        Ok(found)
    }

    fn entries(&self, namespaces: u8) -> Result<Vec<(Key, Val)>, DbError> {
        self.ensure_open()?;
        self.store.entries(namespaces)
    }
}
