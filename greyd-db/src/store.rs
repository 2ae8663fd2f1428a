//! In-memory record store shared by the drivers. Records live under their
//! portable byte encoding so a snapshot written by one driver can be read
//! back by another.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::DbError;
use crate::key::{Key, Val};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Store {
    records: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Store {
    pub fn put(&mut self, key: &Key, val: &Val) -> Result<(), DbError> {
        if key.namespace().is_none() {
            return Err(DbError::NotStorable);
        }
        self.records.insert(key.encode(), val.encode());
        Ok(())
    }

    pub fn get(&self, key: &Key) -> Result<Option<Val>, DbError> {
        self.records
            .get(&key.encode())
            .map(|buf| Val::decode(buf))
            .transpose()
    }

    pub fn del(&mut self, key: &Key) -> bool {
        self.records.remove(&key.encode()).is_some()
    }

    /// Decode every record whose namespace bit is selected, in key order.
    pub fn entries(&self, namespaces: u8) -> Result<Vec<(Key, Val)>, DbError> {
        let mut out = Vec::new();
        for (kbuf, vbuf) in &self.records {
            let key = Key::decode(kbuf)?;
            let selected = key
                .namespace()
                .is_some_and(|namespace| namespace & namespaces != 0);
            if selected {
                out.push((key, Val::decode(vbuf)?));
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
