//! Database key/value model and the portable byte encoding shared by every
//! driver.
//!
//! A key is `type:int16` followed by the payload; tuple payloads are four
//! NUL-terminated strings in the order `ip, helo, from, to`. A value is
//! `type:int16` followed by the greylisting counters with 64-bit
//! timestamps. All integers are big-endian.

use serde::{Deserialize, Serialize};

use crate::DbError;

pub const DB_KEY_IP: i16 = 1;
pub const DB_KEY_MAIL: i16 = 2;
pub const DB_KEY_TUPLE: i16 = 3;
pub const DB_KEY_DOM: i16 = 4;
pub const DB_KEY_DOM_PART: i16 = 5;

pub const DB_VAL_GREY: i16 = 1;

/// Namespace selector bits for iteration.
pub const DB_ENTRIES: u8 = 1;
pub const DB_SPAMTRAPS: u8 = 2;
pub const DB_DOMAINS: u8 = 4;

/// The full greylist tuple key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub ip: String,
    pub helo: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    /// A single address: whitelist or trapped entry.
    Ip(String),
    /// A spamtrap recipient address.
    Mail(String),
    /// A greylist tuple.
    Tuple(Tuple),
    /// A permitted recipient domain.
    Dom(String),
    /// Lookup-only: does any permitted domain suffix-match this recipient?
    DomPart(String),
}

impl Key {
    pub const fn type_code(&self) -> i16 {
        match self {
            Self::Ip(_) => DB_KEY_IP,
            Self::Mail(_) => DB_KEY_MAIL,
            Self::Tuple(_) => DB_KEY_TUPLE,
            Self::Dom(_) => DB_KEY_DOM,
            Self::DomPart(_) => DB_KEY_DOM_PART,
        }
    }

    /// The namespace bit this key stores into; `DomPart` never stores.
    pub const fn namespace(&self) -> Option<u8> {
        match self {
            Self::Ip(_) | Self::Tuple(_) => Some(DB_ENTRIES),
            Self::Mail(_) => Some(DB_SPAMTRAPS),
            Self::Dom(_) => Some(DB_DOMAINS),
            Self::DomPart(_) => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.type_code().to_be_bytes());
        match self {
            Self::Ip(s) | Self::Mail(s) | Self::Dom(s) | Self::DomPart(s) => {
                push_str(&mut out, s);
            }
            Self::Tuple(gt) => {
                push_str(&mut out, &gt.ip);
                push_str(&mut out, &gt.helo);
                push_str(&mut out, &gt.from);
                push_str(&mut out, &gt.to);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DbError> {
        if buf.len() < 2 {
            return Err(DbError::Corrupt("key shorter than type tag".to_string()));
        }
        let code = i16::from_be_bytes([buf[0], buf[1]]);
        let mut rest = &buf[2..];

        match code {
            DB_KEY_IP => Ok(Self::Ip(take_str(&mut rest)?)),
            DB_KEY_MAIL => Ok(Self::Mail(take_str(&mut rest)?)),
            DB_KEY_DOM => Ok(Self::Dom(take_str(&mut rest)?)),
            DB_KEY_DOM_PART => Ok(Self::DomPart(take_str(&mut rest)?)),
            DB_KEY_TUPLE => Ok(Self::Tuple(Tuple {
                ip: take_str(&mut rest)?,
                helo: take_str(&mut rest)?,
                from: take_str(&mut rest)?,
                to: take_str(&mut rest)?,
            })),
            other => Err(DbError::Corrupt(format!("unknown key type {other}"))),
        }
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn take_str(buf: &mut &[u8]) -> Result<String, DbError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| DbError::Corrupt("unterminated key string".to_string()))?;
    let s = std::str::from_utf8(&buf[..nul])
        .map_err(|_| DbError::Corrupt("key string is not UTF-8".to_string()))?
        .to_string();
    *buf = &buf[nul + 1..];
    Ok(s)
}

/// Greylisting counters. `pcount` doubles as the record type marker:
/// non-negative for normal entries, -1 trapped, -2 spamtrap, -3 permitted
/// domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Val {
    pub first: i64,
    pub pass: i64,
    pub expire: i64,
    pub bcount: i32,
    pub pcount: i32,
}

pub const PCOUNT_TRAPPED: i32 = -1;
pub const PCOUNT_SPAMTRAP: i32 = -2;
pub const PCOUNT_DOMAIN: i32 = -3;

impl Val {
    /// A fresh spamtrap address record.
    pub const fn spamtrap(now: i64) -> Self {
        Self {
            first: now,
            pass: 0,
            expire: 0,
            bcount: 1,
            pcount: PCOUNT_SPAMTRAP,
        }
    }

    /// A fresh permitted-domain record.
    pub const fn domain(now: i64) -> Self {
        Self {
            first: now,
            pass: 0,
            expire: 0,
            bcount: 0,
            pcount: PCOUNT_DOMAIN,
        }
    }

    pub const fn is_trapped(&self) -> bool {
        self.pcount == PCOUNT_TRAPPED
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34);
        out.extend_from_slice(&DB_VAL_GREY.to_be_bytes());
        out.extend_from_slice(&self.first.to_be_bytes());
        out.extend_from_slice(&self.pass.to_be_bytes());
        out.extend_from_slice(&self.expire.to_be_bytes());
        out.extend_from_slice(&self.bcount.to_be_bytes());
        out.extend_from_slice(&self.pcount.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DbError> {
        if buf.len() < 34 {
            return Err(DbError::Corrupt("value too short".to_string()));
        }
        let code = i16::from_be_bytes([buf[0], buf[1]]);
        if code != DB_VAL_GREY {
            return Err(DbError::Corrupt(format!("unknown value type {code}")));
        }
        let i64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            i64::from_be_bytes(b)
        };
        let i32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            i32::from_be_bytes(b)
        };
        Ok(Self {
            first: i64_at(2),
            pass: i64_at(10),
            expire: i64_at(18),
            bcount: i32_at(26),
            pcount: i32_at(30),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_layout() {
        let key = Key::Ip("1.2.3.4".to_string());
        let buf = key.encode();
        assert_eq!(&buf[..2], &DB_KEY_IP.to_be_bytes());
        assert_eq!(&buf[2..], b"1.2.3.4\0");
        assert_eq!(Key::decode(&buf).unwrap(), key);
    }

    #[test]
    fn tuple_key_string_order() {
        let key = Key::Tuple(Tuple {
            ip: "1.2.3.4".to_string(),
            helo: "h.example".to_string(),
            from: "f@x".to_string(),
            to: "t@y".to_string(),
        });
        let buf = key.encode();
        assert_eq!(&buf[2..], b"1.2.3.4\0h.example\0f@x\0t@y\0");
        assert_eq!(Key::decode(&buf).unwrap(), key);
    }

    #[test]
    fn val_round_trip() {
        let val = Val {
            first: 1700000000,
            pass: 1700001500,
            expire: 1700014400,
            bcount: 3,
            pcount: -1,
        };
        let buf = val.encode();
        assert_eq!(buf.len(), 34);
        assert_eq!(Val::decode(&buf).unwrap(), val);
    }

    #[test]
    fn corrupt_input_is_rejected() {
        assert!(Key::decode(&[1]).is_err());
        assert!(Key::decode(&[0, 1, b'x']).is_err());
        assert!(Key::decode(&[0, 9, b'x', 0]).is_err());
        assert!(Val::decode(&[0, 1, 2]).is_err());
    }

    #[test]
    fn namespaces() {
        assert_eq!(Key::Ip(String::new()).namespace(), Some(DB_ENTRIES));
        assert_eq!(
            Key::Tuple(Tuple {
                ip: String::new(),
                helo: String::new(),
                from: String::new(),
                to: String::new(),
            })
            .namespace(),
            Some(DB_ENTRIES)
        );
        assert_eq!(Key::Mail(String::new()).namespace(), Some(DB_SPAMTRAPS));
        assert_eq!(Key::Dom(String::new()).namespace(), Some(DB_DOMAINS));
        assert_eq!(Key::DomPart(String::new()).namespace(), None);
    }
}
