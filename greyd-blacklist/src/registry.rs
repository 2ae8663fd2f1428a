//! Process-wide blacklist registry.
//!
//! Owns every configured blacklist, keyed by name. Connections borrow
//! shared references for their lifetime; a configuration reload swaps the
//! whole map atomically, so in-flight connections keep matching against the
//! set they were accepted under.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use greyd_common::addr::Addr;
use greyd_common::config::BlacklistConfig;
use tracing::warn;

use crate::{Blacklist, BlacklistError};

#[derive(Debug, Default)]
pub struct Registry {
    lists: RwLock<Arc<BTreeMap<String, Arc<Blacklist>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the map from configuration. Malformed CIDRs fail the whole
    /// build so a reload never half-applies.
    pub fn from_config(configs: &[BlacklistConfig]) -> Result<Self, BlacklistError> {
        let registry = Self::new();
        registry.rebuild(configs)?;
        Ok(registry)
    }

    pub fn rebuild(&self, configs: &[BlacklistConfig]) -> Result<(), BlacklistError> {
        let mut lists = BTreeMap::new();
        for config in configs {
            let mut bl = Blacklist::new(&config.name, &config.message).with_code(config.code);
            for cidr in &config.cidrs {
                bl.add(cidr)?;
            }
            if lists.insert(config.name.clone(), Arc::new(bl)).is_some() {
                warn!(name = %config.name, "duplicate blacklist definition replaces earlier one");
            }
        }
        self.swap(lists);
        Ok(())
    }

    pub fn swap(&self, lists: BTreeMap<String, Arc<Blacklist>>) {
        let lists = Arc::new(lists);
        match self.lists.write() {
            Ok(mut guard) => *guard = lists,
            Err(poisoned) => *poisoned.into_inner() = lists,
        }
    }

    fn snapshot(&self) -> Arc<BTreeMap<String, Arc<Blacklist>>> {
        match self.lists.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Blacklist>> {
        self.snapshot().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Every list matching the address, in name order.
    pub fn matching(&self, addr: &Addr) -> Vec<Arc<Blacklist>> {
        self.snapshot()
            .values()
            .filter(|bl| bl.match_addr(addr))
            .cloned()
            .collect()
    }
}
