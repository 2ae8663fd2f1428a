//! Driver-independent database handle: the operation surface the engines
//! program against, plus the expiry/promotion scan shared by every
//! back-end.

use std::net::IpAddr;

use greyd_common::config::DatabaseConfig;
use tracing::debug;

use crate::DbError;
use crate::driver::{Driver, from_config};
use crate::key::{DB_DOMAINS, DB_ENTRIES, Key, Val};

/// Result of [`Handle::addr_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrState {
    NotFound,
    Trapped,
    Whitelisted,
}

/// What a scan pass produced for the firewall and the sync engine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// IPv4 addresses currently whitelisted.
    pub whitelist: Vec<String>,
    /// IPv6 addresses currently whitelisted.
    pub whitelist_ipv6: Vec<String>,
    /// Trapped addresses for the firewall blacklist loader.
    pub traplist: Vec<String>,
    /// Addresses promoted from tuple to whitelist during this pass.
    pub promoted: Vec<String>,
}

#[derive(Debug)]
pub struct Handle {
    driver: Box<dyn Driver>,
}

impl Handle {
    /// Open a handle over the configured driver.
    pub fn open(config: &DatabaseConfig) -> Result<Self, DbError> {
        let mut driver = from_config(config)?;
        driver.open()?;
        Ok(Self { driver })
    }

    pub fn from_driver(mut driver: Box<dyn Driver>) -> Result<Self, DbError> {
        driver.open()?;
        Ok(Self { driver })
    }

    pub fn close(&mut self) {
        self.driver.close();
    }

    pub fn start_txn(&mut self) -> Result<(), DbError> {
        self.driver.start_txn()
    }

    pub fn commit_txn(&mut self) -> Result<(), DbError> {
        self.driver.commit_txn()
    }

    pub fn rollback_txn(&mut self) -> Result<(), DbError> {
        self.driver.rollback_txn()
    }

    pub fn put(&mut self, key: &Key, val: &Val) -> Result<(), DbError> {
        self.driver.put(key, val)
    }

    /// Point lookup. A `DomPart` key is answered by scanning the permitted
    /// domains for a case-insensitive suffix match against the query.
    pub fn get(&mut self, key: &Key) -> Result<Option<Val>, DbError> {
        if let Key::DomPart(part) = key {
            let part = part.to_lowercase();
            for (domain_key, val) in self.driver.entries(DB_DOMAINS)? {
                if let Key::Dom(domain) = domain_key {
                    if part.ends_with(&domain.to_lowercase()) {
                        return Ok(Some(val));
                    }
                }
            }
            return Ok(None);
        }
        self.driver.get(key)
    }

    pub fn del(&mut self, key: &Key) -> Result<bool, DbError> {
        self.driver.del(key)
    }

    /// Iterate the selected namespaces with mutate-at-cursor support.
    pub fn cursor(&mut self, namespaces: u8) -> Result<Cursor<'_>, DbError> {
        let items = self.driver.entries(namespaces)?;
        Ok(Cursor {
            handle: self,
            items,
            pos: None,
        })
    }

    /// State of a bare address: trapped, whitelisted, or absent.
    pub fn addr_state(&mut self, ip: &str) -> Result<AddrState, DbError> {
        match self.get(&Key::Ip(ip.to_string()))? {
            None => Ok(AddrState::NotFound),
            Some(val) if val.is_trapped() => Ok(AddrState::Trapped),
            Some(_) => Ok(AddrState::Whitelisted),
        }
    }

    /// Expiry and promotion scan over the entry namespace, in one
    /// transaction:
    ///
    /// - expired non-spamtrap records are deleted;
    /// - trapped addresses feed the traplist;
    /// - tuples past their pass time are promoted to address-keyed
    ///   whitelist records (unless the address is trapped) and whitelisted
    ///   addresses are collected per family.
    pub fn scan(&mut self, now: i64, white_exp: i64) -> Result<ScanOutcome, DbError> {
        self.start_txn()?;
        let result = self.scan_inner(now, white_exp);
        match result {
            Ok(outcome) => {
                self.commit_txn()?;
                Ok(outcome)
            }
            Err(err) => {
                self.rollback_txn()?;
                Err(err)
            }
        }
    }

    fn scan_inner(&mut self, now: i64, white_exp: i64) -> Result<ScanOutcome, DbError> {
        let mut outcome = ScanOutcome::default();

        for (key, val) in self.driver.entries(DB_ENTRIES)? {
            if val.expire <= now && val.pcount > -2 {
                self.driver.del(&key)?;
                let kind = match &key {
                    Key::Ip(_) if val.pcount >= 0 => "white",
                    Key::Ip(_) => "greytrap",
                    _ => "grey",
                };
                debug!(kind, key = ?key, "deleting expired entry");
                continue;
            }

            match &key {
                Key::Ip(ip) if val.is_trapped() => {
                    outcome.traplist.push(ip.clone());
                }
                Key::Tuple(gt) if val.pcount >= 0 && val.pass <= now => {
                    match self.addr_state(&gt.ip)? {
                        AddrState::Trapped => continue,
                        AddrState::NotFound | AddrState::Whitelisted => {}
                    }

                    push_by_family(&mut outcome, &gt.ip);

                    // Re-add keyed only by address, counters carried over.
                    let wval = Val {
                        expire: now + white_exp,
                        ..val
                    };
                    self.driver.put(&Key::Ip(gt.ip.clone()), &wval)?;
                    self.driver.del(&key)?;
                    outcome.promoted.push(gt.ip.clone());
                    debug!(ip = %gt.ip, "whitelisting");
                }
                Key::Ip(ip) if val.pcount >= 0 && val.pass <= now => {
                    push_by_family(&mut outcome, ip);
                }
                _ => {}
            }
        }

        Ok(outcome)
    }
}

fn push_by_family(outcome: &mut ScanOutcome, ip: &str) {
    let is_v6 = ip.parse::<IpAddr>().is_ok_and(|addr| addr.is_ipv6());
    if is_v6 {
        outcome.whitelist_ipv6.push(ip.to_string());
    } else {
        outcome.whitelist.push(ip.to_string());
    }
}

/// Iterator over a namespace snapshot that can delete or replace the record
/// under the cursor.
#[derive(Debug)]
pub struct Cursor<'a> {
    handle: &'a mut Handle,
    items: Vec<(Key, Val)>,
    pos: Option<usize>,
}

impl Cursor<'_> {
    pub fn next_entry(&mut self) -> Option<(Key, Val)> {
        let next = self.pos.map_or(0, |pos| pos + 1);
        if next >= self.items.len() {
            return None;
        }
        self.pos = Some(next);
        Some(self.items[next].clone())
    }

    pub fn replace_curr(&mut self, val: &Val) -> Result<(), DbError> {
        match self.pos {
            Some(pos) => {
                let key = self.items[pos].0.clone();
                self.items[pos].1 = *val;
                self.handle.put(&key, val)
            }
            None => Err(DbError::Corrupt("cursor not positioned".to_string())),
        }
    }

    pub fn del_curr(&mut self) -> Result<bool, DbError> {
        match self.pos {
            Some(pos) => {
                let key = self.items[pos].0.clone();
                self.handle.del(&key)
            }
            None => Err(DbError::Corrupt("cursor not positioned".to_string())),
        }
    }
}
