//! The greylisting policy: how a pipe event mutates the database.
//!
//! Every event is applied inside one transaction; a failed mutation rolls
//! back and drops that event only. The value returned from [`Greylister::apply`]
//! tells the caller which mutations to replicate to sync peers.

use greyd_common::config::{Config, GreyConfig};
use greyd_common::pipe::{AddrEvent, GreyEvent};
use greyd_db::key::{PCOUNT_TRAPPED, Tuple};
use greyd_db::{DbError, Handle, Key, Val};
use tracing::debug;

use crate::GreyError;

/// Seconds after startup before the low-priority MX rule may fire, so a
/// daemon restart does not misclassify an in-flight delivery.
const LOW_PRIO_MX_GRACE: i64 = 60;

/// A replication action owed to sync peers after a local mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    Grey {
        ip: String,
        from: String,
        to: String,
        helo: String,
    },
    White {
        ip: String,
        expire: i64,
        delete: bool,
    },
    Trapped {
        ip: String,
        expire: i64,
        delete: bool,
    },
}

#[derive(Debug)]
pub struct Greylister {
    grey: GreyConfig,
    low_prio_mx: Option<String>,
    /// In-memory permitted domains, lower-cased.
    domains: Vec<String>,
    startup: i64,
}

impl Greylister {
    pub fn new(config: &Config, startup: i64) -> Result<Self, GreyError> {
        let domains = match &config.grey.permitted_domains {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| GreyError::Domains {
                    path: path.display().to_string(),
                    source,
                })?;
                raw.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_lowercase)
                    .collect()
            }
            None => Vec::new(),
        };

        Ok(Self {
            grey: config.grey.clone(),
            low_prio_mx: config.low_prio_mx.clone(),
            domains,
            startup,
        })
    }

    /// Test constructor bypassing the domains file.
    pub fn with_domains(config: &Config, startup: i64, domains: Vec<String>) -> Self {
        Self {
            grey: config.grey.clone(),
            low_prio_mx: config.low_prio_mx.clone(),
            domains: domains.into_iter().map(|d| d.to_lowercase()).collect(),
            startup,
        }
    }

    pub const fn config(&self) -> &GreyConfig {
        &self.grey
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Apply one pipe event inside a transaction. On a database error the
    /// transaction is rolled back and the event is lost.
    pub fn apply(
        &self,
        db: &mut Handle,
        event: &GreyEvent,
        now: i64,
    ) -> Result<Vec<Broadcast>, GreyError> {
        db.start_txn()?;
        match self.apply_inner(db, event, now) {
            Ok(broadcasts) => {
                db.commit_txn()?;
                Ok(broadcasts)
            }
            Err(err) => {
                db.rollback_txn()?;
                Err(err)
            }
        }
    }

    fn apply_inner(
        &self,
        db: &mut Handle,
        event: &GreyEvent,
        now: i64,
    ) -> Result<Vec<Broadcast>, GreyError> {
        match event {
            GreyEvent::Grey {
                dst_ip,
                ip,
                helo,
                from,
                to,
                sync,
            } => self.apply_grey(db, dst_ip.as_deref(), ip, helo, from, to, *sync, now),
            GreyEvent::White(addr) => Self::apply_white(db, addr, now),
            GreyEvent::Trap(addr) => Self::apply_trap(db, addr, now),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_grey(
        &self,
        db: &mut Handle,
        dst_ip: Option<&str>,
        ip: &str,
        helo: &str,
        from: &str,
        to: &str,
        sync: bool,
        now: i64,
    ) -> Result<Vec<Broadcast>, GreyError> {
        let mut broadcasts = Vec::new();

        if self.trap_check(db, to)? {
            // The recipient betrays a spam run. Trap the source address.
            let expire = now + self.grey.trap_expiry;
            let key = Key::Ip(ip.to_string());
            let val = match db.get(&key)? {
                Some(existing) if existing.is_trapped() => Val {
                    expire,
                    bcount: existing.bcount + 1,
                    ..existing
                },
                _ => Val {
                    first: now,
                    pass: 0,
                    expire,
                    bcount: 1,
                    pcount: PCOUNT_TRAPPED,
                },
            };
            db.put(&key, &val)?;
            debug!(%ip, %to, "greytrapping");
            if sync {
                broadcasts.push(Broadcast::Trapped {
                    ip: ip.to_string(),
                    expire,
                    delete: false,
                });
            }
            return Ok(broadcasts);
        }

        if let Some(mx) = &self.low_prio_mx {
            if dst_ip == Some(mx.as_str()) && self.startup + LOW_PRIO_MX_GRACE < now {
                // Delivery came in via the backup MX; treat the source as an
                // immediate pass candidate rather than making it walk the
                // full greylist delay.
                let expire = now + self.grey.white_exp;
                let val = Val {
                    first: now,
                    pass: now,
                    expire,
                    bcount: 1,
                    pcount: 0,
                };
                db.put(&Key::Ip(ip.to_string()), &val)?;
                debug!(%ip, "whitelisting backup MX client");
                if sync {
                    broadcasts.push(Broadcast::White {
                        ip: ip.to_string(),
                        expire,
                        delete: false,
                    });
                }
                return Ok(broadcasts);
            }
        }

        let key = Key::Tuple(Tuple {
            ip: ip.to_string(),
            helo: helo.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });

        match db.get(&key)? {
            Some(val) => {
                let val = Val {
                    bcount: val.bcount + 1,
                    expire: now + self.grey.grey_expiry,
                    ..val
                };
                if val.pass <= now {
                    // The retry came after the delay: promote to an
                    // address-keyed whitelist record and drop the tuple.
                    let expire = now + self.grey.white_exp;
                    let wval = Val {
                        expire,
                        pcount: 0,
                        ..val
                    };
                    db.put(&Key::Ip(ip.to_string()), &wval)?;
                    db.del(&key)?;
                    debug!(%ip, "whitelisting greylisted client");
                    if sync {
                        broadcasts.push(Broadcast::White {
                            ip: ip.to_string(),
                            expire,
                            delete: false,
                        });
                    }
                } else {
                    db.put(&key, &val)?;
                }
            }
            None => {
                let val = Val {
                    first: now,
                    pass: now + self.grey.pass_time,
                    expire: now + self.grey.grey_expiry,
                    bcount: 1,
                    pcount: 0,
                };
                db.put(&key, &val)?;
                debug!(%ip, %from, %to, "new grey entry");
            }
        }

        if sync {
            broadcasts.push(Broadcast::Grey {
                ip: ip.to_string(),
                from: from.to_string(),
                to: to.to_string(),
                helo: helo.to_string(),
            });
        }
        Ok(broadcasts)
    }

    fn apply_white(
        db: &mut Handle,
        addr: &AddrEvent,
        now: i64,
    ) -> Result<Vec<Broadcast>, GreyError> {
        let key = Key::Ip(addr.ip.clone());
        if addr.delete {
            db.del(&key)?;
            debug!(ip = %addr.ip, source = %addr.source, "deleted white entry");
        } else {
            let val = match db.get(&key)? {
                Some(existing) => Val {
                    pass: now,
                    expire: addr.expires,
                    pcount: existing.pcount + 1,
                    ..existing
                },
                None => Val {
                    first: now,
                    pass: now,
                    expire: addr.expires,
                    bcount: 0,
                    pcount: 0,
                },
            };
            db.put(&key, &val)?;
            debug!(ip = %addr.ip, source = %addr.source, "white entry");
        }

        Ok(if addr.sync {
            vec![Broadcast::White {
                ip: addr.ip.clone(),
                expire: addr.expires,
                delete: addr.delete,
            }]
        } else {
            Vec::new()
        })
    }

    fn apply_trap(
        db: &mut Handle,
        addr: &AddrEvent,
        now: i64,
    ) -> Result<Vec<Broadcast>, GreyError> {
        let key = Key::Ip(addr.ip.clone());
        if addr.delete {
            db.del(&key)?;
            debug!(ip = %addr.ip, source = %addr.source, "deleted trapped entry");
        } else {
            let val = match db.get(&key)? {
                Some(existing) if existing.is_trapped() => Val {
                    expire: addr.expires,
                    ..existing
                },
                _ => Val {
                    first: now,
                    pass: 0,
                    expire: addr.expires,
                    bcount: 1,
                    pcount: PCOUNT_TRAPPED,
                },
            };
            db.put(&key, &val)?;
            debug!(ip = %addr.ip, source = %addr.source, "trapped entry");
        }

        Ok(if addr.sync {
            vec![Broadcast::Trapped {
                ip: addr.ip.clone(),
                expire: addr.expires,
                delete: addr.delete,
            }]
        } else {
            Vec::new()
        })
    }

    /// Should mail to this recipient trap the sender? True when the
    /// recipient is a spamtrap address, or when domain policy is active and
    /// no permitted domain suffix-matches the recipient.
    fn trap_check(&self, db: &mut Handle, to: &str) -> Result<bool, DbError> {
        let recipient = to.to_lowercase();

        if db.get(&Key::Mail(recipient.clone()))?.is_some() {
            return Ok(true);
        }

        if self.domains.is_empty() && !self.grey.db_permitted_domains {
            return Ok(false);
        }
        if self.domains.iter().any(|domain| recipient.ends_with(domain)) {
            return Ok(false);
        }
        if self.grey.db_permitted_domains && db.get(&Key::DomPart(recipient))?.is_some() {
            return Ok(false);
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greyd_db::MemoryDriver;

    fn db() -> Handle {
        Handle::from_driver(Box::new(MemoryDriver::new())).unwrap()
    }

    fn greylister(domains: Vec<&str>) -> Greylister {
        let config = Config::parse(
            r#"
            low_prio_mx = "192.179.21.3"
            [grey]
            grey_expiry = 3600
            db_permitted_domains = true
            "#,
        )
        .unwrap();
        Greylister::with_domains(
            &config,
            880, // startup comfortably past the grace window at now=1000
            domains.into_iter().map(ToString::to_string).collect(),
        )
    }

    fn grey_event(dst: Option<&str>, ip: &str, to: &str) -> GreyEvent {
        GreyEvent::Grey {
            dst_ip: dst.map(ToString::to_string),
            ip: ip.to_string(),
            helo: "jackiemclean.net".to_string(),
            from: "m@jackiemclean.net".to_string(),
            to: to.to_string(),
            sync: true,
        }
    }

    #[test]
    fn new_loads_domains_file() {
        use std::io::Write as _;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# permitted recipient domains").unwrap();
        writeln!(file, "Domain4.COM").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "domain2.com").unwrap();

        let config = Config::parse(&format!(
            "[grey]\npermitted_domains = {:?}",
            file.path().display().to_string()
        ))
        .unwrap();

        let gl = Greylister::new(&config, 0).unwrap();
        assert_eq!(gl.domains(), ["domain4.com", "domain2.com"]);
    }

    #[test]
    fn new_fails_on_missing_domains_file() {
        let config =
            Config::parse("[grey]\npermitted_domains = \"/nonexistent/domains.txt\"").unwrap();
        assert!(matches!(
            Greylister::new(&config, 0),
            Err(GreyError::Domains { .. })
        ));
    }

    #[test]
    fn new_tuple_gets_counters_and_lifetimes() {
        let mut db = db();
        let gl = greylister(vec!["domain1.com"]);
        let now = 1000;

        let broadcasts = gl.apply(&mut db, &grey_event(None, "1.2.3.4", "r@domain1.com"), now).unwrap();
        assert_eq!(broadcasts.len(), 1);
        assert!(matches!(broadcasts[0], Broadcast::Grey { .. }));

        let key = Key::Tuple(Tuple {
            ip: "1.2.3.4".to_string(),
            helo: "jackiemclean.net".to_string(),
            from: "m@jackiemclean.net".to_string(),
            to: "r@domain1.com".to_string(),
        });
        let val = db.get(&key).unwrap().unwrap();
        assert_eq!(val.first, now);
        assert_eq!(val.pass, now + gl.config().pass_time);
        assert_eq!(val.expire, now + 3600);
        assert_eq!(val.bcount, 1);
        assert_eq!(val.pcount, 0);
    }

    #[test]
    fn retry_before_pass_only_counts() {
        let mut db = db();
        let gl = greylister(vec!["domain1.com"]);
        let event = grey_event(None, "1.2.3.4", "r@domain1.com");

        gl.apply(&mut db, &event, 1000).unwrap();
        gl.apply(&mut db, &event, 1060).unwrap();

        let key = Key::Tuple(Tuple {
            ip: "1.2.3.4".to_string(),
            helo: "jackiemclean.net".to_string(),
            from: "m@jackiemclean.net".to_string(),
            to: "r@domain1.com".to_string(),
        });
        let val = db.get(&key).unwrap().unwrap();
        assert_eq!(val.bcount, 2);
        assert_eq!(val.pcount, 0);
        assert_eq!(db.addr_state("1.2.3.4").unwrap(), greyd_db::AddrState::NotFound);
    }

    #[test]
    fn retry_after_pass_promotes_atomically() {
        let mut db = db();
        let gl = greylister(vec!["domain1.com"]);
        let event = grey_event(None, "1.2.3.4", "r@domain1.com");

        gl.apply(&mut db, &event, 1000).unwrap();
        let later = 1000 + gl.config().pass_time + 1;
        let broadcasts = gl.apply(&mut db, &event, later).unwrap();

        // Tuple gone, address record present.
        let key = Key::Tuple(Tuple {
            ip: "1.2.3.4".to_string(),
            helo: "jackiemclean.net".to_string(),
            from: "m@jackiemclean.net".to_string(),
            to: "r@domain1.com".to_string(),
        });
        assert!(db.get(&key).unwrap().is_none());
        let white = db.get(&Key::Ip("1.2.3.4".to_string())).unwrap().unwrap();
        assert_eq!(white.expire, later + gl.config().white_exp);
        assert_eq!(white.pcount, 0);

        assert!(broadcasts.iter().any(|b| matches!(b, Broadcast::White { delete: false, .. })));
    }

    #[test]
    fn spamtrap_recipient_traps_source() {
        let mut db = db();
        db.put(&Key::Mail("trap@domain3.com".to_string()), &Val::spamtrap(0))
            .unwrap();
        let gl = greylister(vec!["domain3.com"]);

        let broadcasts = gl
            .apply(&mut db, &grey_event(None, "1.2.2.4", "trap@domain3.com"), 1000)
            .unwrap();

        let val = db.get(&Key::Ip("1.2.2.4".to_string())).unwrap().unwrap();
        assert!(val.is_trapped());
        assert_eq!(val.expire, 1000 + gl.config().trap_expiry);
        assert!(matches!(broadcasts[0], Broadcast::Trapped { delete: false, .. }));
    }

    #[test]
    fn unpermitted_domain_traps_source() {
        let mut db = db();
        db.put(&Key::Dom("domain1.com".to_string()), &Val::domain(0))
            .unwrap();
        let gl = greylister(vec!["domain4.com", "domain2.com"]);

        // Permitted via the database.
        gl.apply(&mut db, &grey_event(None, "2.3.4.5", "r@domain1.com"), 1000)
            .unwrap();
        assert_eq!(db.addr_state("2.3.4.5").unwrap(), greyd_db::AddrState::NotFound);

        // Permitted via the in-memory list.
        gl.apply(&mut db, &grey_event(None, "2.3.4.6", "x@domain4.com"), 1000)
            .unwrap();
        assert_eq!(db.addr_state("2.3.4.6").unwrap(), greyd_db::AddrState::NotFound);

        // Permitted nowhere.
        gl.apply(
            &mut db,
            &grey_event(None, "2.3.4.7", "trap@willbetrapped.com"),
            1000,
        )
        .unwrap();
        assert_eq!(db.addr_state("2.3.4.7").unwrap(), greyd_db::AddrState::Trapped);
    }

    #[test]
    fn domain_policy_inactive_without_sources() {
        let config = Config::parse("[grey]\ngrey_expiry = 3600").unwrap();
        let gl = Greylister::with_domains(&config, 0, Vec::new());
        let mut db = db();

        gl.apply(&mut db, &grey_event(None, "5.5.5.5", "any@anywhere.org"), 1000)
            .unwrap();
        assert_eq!(db.addr_state("5.5.5.5").unwrap(), greyd_db::AddrState::NotFound);
    }

    #[test]
    fn low_prio_mx_hit_passes_immediately() {
        let mut db = db();
        let gl = greylister(vec!["domain4.com"]);

        let broadcasts = gl
            .apply(
                &mut db,
                &grey_event(Some("192.179.21.3"), "1.2.2.34", "notrap@domain4.com"),
                1000,
            )
            .unwrap();

        let val = db.get(&Key::Ip("1.2.2.34".to_string())).unwrap().unwrap();
        assert_eq!(val.pcount, 0);
        assert_eq!(val.pass, 1000);
        assert!(matches!(broadcasts[0], Broadcast::White { .. }));
    }

    #[test]
    fn low_prio_mx_waits_for_startup_grace() {
        let config = Config::parse("low_prio_mx = \"192.179.21.3\"").unwrap();
        let gl = Greylister::with_domains(&config, 990, Vec::new());
        let mut db = db();

        gl.apply(
            &mut db,
            &grey_event(Some("192.179.21.3"), "1.2.2.34", "r@anywhere.org"),
            1000,
        )
        .unwrap();

        // Within the grace window the event greylists normally.
        assert!(db.get(&Key::Ip("1.2.2.34".to_string())).unwrap().is_none());
    }

    #[test]
    fn white_event_updates_and_deletes() {
        let mut db = db();
        let gl = greylister(vec![]);
        let white = |delete| {
            GreyEvent::White(AddrEvent {
                ip: "4.3.2.1".to_string(),
                source: "2.3.4.5".to_string(),
                expires: 5000,
                delete,
                sync: true,
            })
        };

        gl.apply(&mut db, &white(false), 1000).unwrap();
        let val = db.get(&Key::Ip("4.3.2.1".to_string())).unwrap().unwrap();
        assert_eq!((val.pcount, val.bcount, val.pass), (0, 0, 1000));

        // A duplicate add counts a pass.
        gl.apply(&mut db, &white(false), 1100).unwrap();
        let val = db.get(&Key::Ip("4.3.2.1".to_string())).unwrap().unwrap();
        assert_eq!(val.pcount, 1);

        let broadcasts = gl.apply(&mut db, &white(true), 1200).unwrap();
        assert!(db.get(&Key::Ip("4.3.2.1".to_string())).unwrap().is_none());
        assert_eq!(broadcasts, vec![Broadcast::White {
            ip: "4.3.2.1".to_string(),
            expire: 5000,
            delete: true,
        }]);
    }

    #[test]
    fn replicated_events_are_not_rebroadcast() {
        let mut db = db();
        let gl = greylister(vec![]);
        let event = GreyEvent::Trap(AddrEvent {
            ip: "3.4.2.1".to_string(),
            source: "3.2.4.5".to_string(),
            expires: 5000,
            delete: false,
            sync: false,
        });
        assert!(gl.apply(&mut db, &event, 1000).unwrap().is_empty());
        assert_eq!(db.addr_state("3.4.2.1").unwrap(), greyd_db::AddrState::Trapped);
    }

    #[test]
    fn trapped_source_blocks_tuple_promotion_by_scan() {
        let mut db = db();
        let gl = greylister(vec!["domain1.com"]);
        let now = 1000;

        gl.apply(&mut db, &grey_event(None, "6.6.6.6", "r@domain1.com"), now)
            .unwrap();
        gl.apply(
            &mut db,
            &GreyEvent::Trap(AddrEvent {
                ip: "6.6.6.6".to_string(),
                source: "x".to_string(),
                expires: now + 9000,
                delete: false,
                sync: false,
            }),
            now,
        )
        .unwrap();

        let outcome = db
            .scan(now + gl.config().pass_time + 1, gl.config().white_exp)
            .unwrap();
        assert!(outcome.whitelist.is_empty());
        assert_eq!(outcome.traplist, vec!["6.6.6.6".to_string()]);
    }
}
