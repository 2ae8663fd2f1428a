//! Address and CIDR model shared by the blacklist engine and the firewall
//! message builders.
//!
//! Addresses are carried as host-order integers so that range arithmetic
//! (endpoint sweeps, block alignment) is plain integer math regardless of
//! family.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::AddrError;

/// Address family of an [`Addr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const fn bits(self) -> u32 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

/// A single IPv4 or IPv6 address in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Addr {
    V4(u32),
    V6(u128),
}

impl Addr {
    pub const fn family(&self) -> Family {
        match self {
            Self::V4(_) => Family::V4,
            Self::V6(_) => Family::V6,
        }
    }

    /// Widened host-order value, usable for family-agnostic arithmetic.
    pub const fn value(&self) -> u128 {
        match *self {
            Self::V4(v) => v as u128,
            Self::V6(v) => v,
        }
    }

    pub const fn from_value(value: u128, family: Family) -> Self {
        match family {
            Family::V4 => Self::V4(value as u32),
            Family::V6 => Self::V6(value),
        }
    }

    /// Network-order bytes, 4 or 16 of them depending on family.
    pub fn octets(&self) -> Vec<u8> {
        match *self {
            Self::V4(v) => v.to_be_bytes().to_vec(),
            Self::V6(v) => v.to_be_bytes().to_vec(),
        }
    }
}

impl From<IpAddr> for Addr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::V4(u32::from(v4)),
            IpAddr::V6(v6) => Self::V6(u128::from(v6)),
        }
    }
}

impl From<Addr> for IpAddr {
    fn from(addr: Addr) -> Self {
        match addr {
            Addr::V4(v) => IpAddr::V4(Ipv4Addr::from(v)),
            Addr::V6(v) => IpAddr::V6(Ipv6Addr::from(v)),
        }
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<IpAddr>()
            .map(Self::from)
            .map_err(|_| AddrError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        IpAddr::from(*self).fmt(f)
    }
}

/// An address block: base address plus prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub addr: Addr,
    pub prefix: u8,
}

impl Cidr {
    pub fn new(addr: Addr, prefix: u8) -> Result<Self, AddrError> {
        if u32::from(prefix) > addr.family().bits() {
            return Err(AddrError::InvalidPrefix {
                addr: addr.to_string(),
                prefix,
            });
        }
        Ok(Self { addr, prefix })
    }

    pub const fn family(&self) -> Family {
        self.addr.family()
    }

    /// The block base with host bits cleared.
    pub fn network(&self) -> Addr {
        let bits = self.family().bits();
        let host = bits - u32::from(self.prefix);
        let value = if host >= 128 {
            0
        } else {
            (self.addr.value() >> host) << host
        };
        Addr::from_value(value, self.family())
    }

    /// Key material for trie storage: the network bytes truncated to the
    /// bytes the prefix reaches into, plus the prefix bit length.
    pub fn key(&self) -> (Vec<u8>, usize) {
        let nbytes = (usize::from(self.prefix) + 7) / 8;
        let mut bytes = self.network().octets();
        bytes.truncate(nbytes);
        (bytes, usize::from(self.prefix))
    }
}

impl FromStr for Cidr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => {
                let addr: Addr = a.parse()?;
                let prefix: u8 = p
                    .parse()
                    .map_err(|_| AddrError::Malformed(s.to_string()))?;
                (addr, prefix)
            }
            None => {
                let addr: Addr = s.parse()?;
                let prefix = addr.family().bits() as u8;
                (addr, prefix)
            }
        };
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

/// Expand the half-open address range `[lo, hi)` into the minimal set of
/// aligned blocks, in address order. Repeatedly consumes the largest
/// power-of-two block that both starts aligned at `lo` and fits before `hi`.
pub fn span_cidrs(lo: Addr, hi_exclusive: u128, family: Family) -> Vec<Cidr> {
    let bits = family.bits();
    let mut lo = lo.value();
    let mut out = Vec::new();

    while lo < hi_exclusive {
        let remaining = hi_exclusive - lo;
        let align = if lo == 0 {
            bits
        } else {
            lo.trailing_zeros().min(bits)
        };
        let fit = 127 - remaining.leading_zeros();
        let k = align.min(fit);

        out.push(Cidr {
            addr: Addr::from_value(lo, family),
            prefix: (bits - k) as u8,
        });
        lo += 1u128 << k;
    }

    out
}
