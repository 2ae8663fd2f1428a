//! A named blacklist: accumulated range endpoints with black/white
//! overlays, collapsed on demand into a minimal CIDR cover backed by a
//! radix trie for membership tests.

use std::str::FromStr;

use greyd_common::addr::{Addr, Cidr, Family, span_cidrs};

use crate::BlacklistError;
use crate::trie::{Key, Trie, prefix};

/// Overlay kind for a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Black,
    White,
}

/// One endpoint of a half-open range. `black`/`white` are +1 on the opening
/// endpoint and -1 on the closing endpoint of the respective overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub value: u128,
    pub family: Family,
    pub black: i32,
    pub white: i32,
}

#[derive(Debug)]
pub struct Blacklist {
    pub name: String,
    pub message: String,
    pub code: u16,
    entries: Vec<Endpoint>,
    trie: Trie,
}

impl Blacklist {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            code: 450,
            entries: Vec::new(),
            trie: Trie::new(prefix),
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    pub fn entries(&self) -> &[Endpoint] {
        &self.entries
    }

    /// Record the half-open range `[lo, hi)`. Nothing is collapsed eagerly;
    /// overlapping ranges accumulate as endpoint pairs.
    pub fn add_range(&mut self, lo: Addr, hi_exclusive: u128, kind: Kind) {
        let family = lo.family();
        let (black, white) = match kind {
            Kind::Black => (1, 0),
            Kind::White => (0, 1),
        };
        self.entries.push(Endpoint {
            value: lo.value(),
            family,
            black,
            white,
        });
        self.entries.push(Endpoint {
            value: hi_exclusive,
            family,
            black: -black,
            white: -white,
        });
    }

    /// Parse a single CIDR and insert it into the trie directly, bypassing
    /// the range machinery. Used for configured per-list matches.
    pub fn add(&mut self, cidr: &str) -> Result<(), BlacklistError> {
        let cidr = Cidr::from_str(cidr)?;
        let (bytes, bits) = cidr.key();
        self.trie.insert(Key::new(bytes, bits));
        Ok(())
    }

    /// Collapse the accumulated endpoints into the minimal CIDR cover of
    /// every address where the black overlay is open and the white overlay
    /// is not, then load the cover into the trie. Returns the cover in
    /// address order, IPv4 blocks first.
    pub fn collapse(&mut self) -> Vec<Cidr> {
        let mut cidrs = Vec::new();
        for family in [Family::V4, Family::V6] {
            self.collapse_family(family, &mut cidrs);
        }

        for cidr in &cidrs {
            let (bytes, bits) = cidr.key();
            self.trie.insert(Key::new(bytes, bits));
        }

        cidrs
    }

    fn collapse_family(&self, family: Family, out: &mut Vec<Cidr>) {
        let mut points: Vec<&Endpoint> = self
            .entries
            .iter()
            .filter(|e| e.family == family)
            .collect();
        points.sort_by_key(|e| e.value);

        let mut black = 0i32;
        let mut white = 0i32;
        let mut prev = 0u128;
        let mut idx = 0;

        while idx < points.len() {
            let value = points[idx].value;
            if black > 0 && white == 0 && prev < value {
                out.extend(span_cidrs(Addr::from_value(prev, family), value, family));
            }
            while idx < points.len() && points[idx].value == value {
                black += points[idx].black;
                white += points[idx].white;
                idx += 1;
            }
            debug_assert!(black >= 0 && white >= 0);
            prev = value;
        }
    }

    /// Trie membership test for a single address.
    pub fn match_addr(&self, addr: &Addr) -> bool {
        let bytes = addr.octets();
        let bits = bytes.len() * 8;
        self.trie.contains(&Key::new(bytes, bits))
    }
}
