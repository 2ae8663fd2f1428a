//! Sync packet wire format.
//!
//! All fields network byte order. A packet is a fixed header followed by a
//! sequence of TLVs:
//!
//! ```text
//! header:  version(1) af(1) counter(4) length(2) hmac(20)
//! grey:    type(2) length(2) timestamp(4) ip(4)
//!          from_len(2) to_len(2) helo_len(2)
//!          <from\0><to\0><helo\0>    padded to 8-byte alignment
//! addr:    type(2) length(2) timestamp(4) expire(4) ip(4)
//! end:     type(2) length(2)
//! ```
//!
//! The HMAC is SHA1 over the whole packet with the HMAC field zeroed.

use std::net::Ipv4Addr;

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::SyncError;

pub const SYNC_VERSION: u8 = 2;
pub const SYNC_AF_INET: u8 = 2;
pub const SYNC_HMAC_LEN: usize = 20;
pub const SYNC_HEADER_LEN: usize = 28;
pub const SYNC_MAXSIZE: usize = 1408;

pub const SYNC_END: u16 = 0;
pub const SYNC_GREY: u16 = 1;
pub const SYNC_WHITE: u16 = 2;
pub const SYNC_TRAPPED: u16 = 3;
pub const SYNC_DEL_WHITE: u16 = 4;
pub const SYNC_DEL_TRAPPED: u16 = 5;

const GREY_FIXED_LEN: usize = 18;
const ADDR_TLV_LEN: usize = 16;
const END_TLV_LEN: usize = 4;

type HmacSha1 = Hmac<Sha1>;

const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Address-record flavour carried in WHITE/TRAPPED TLVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    White,
    Trapped,
}

/// One decoded record from a verified packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRecord {
    Grey {
        timestamp: u32,
        ip: Ipv4Addr,
        from: String,
        to: String,
        helo: String,
    },
    Addr {
        kind: AddrKind,
        delete: bool,
        timestamp: u32,
        expire: u32,
        ip: Ipv4Addr,
    },
}

fn seal(mut packet: Vec<u8>, key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).unwrap_or_else(|_| {
        // new_from_slice accepts keys of any length.
        unreachable!("HMAC-SHA1 accepts any key length")
    });
    mac.update(&packet);
    let digest = mac.finalize().into_bytes();
    packet[8..8 + SYNC_HMAC_LEN].copy_from_slice(&digest);
    packet
}

fn header(counter: u32, length: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(usize::from(length));
    out.push(SYNC_VERSION);
    out.push(SYNC_AF_INET);
    out.extend_from_slice(&counter.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&[0u8; SYNC_HMAC_LEN]);
    out
}

fn end_tlv(out: &mut Vec<u8>) {
    out.extend_from_slice(&SYNC_END.to_be_bytes());
    out.extend_from_slice(&(END_TLV_LEN as u16).to_be_bytes());
}

/// Build an authenticated packet carrying a single grey tuple.
pub fn build_grey(
    key: &[u8],
    counter: u32,
    now: u32,
    ip: Ipv4Addr,
    from: &str,
    to: &str,
    helo: &str,
) -> Vec<u8> {
    let from_len = from.len() + 1;
    let to_len = to.len() + 1;
    let helo_len = helo.len() + 1;

    let tlv_len = align8(GREY_FIXED_LEN + from_len + to_len + helo_len);
    let total = SYNC_HEADER_LEN + tlv_len + END_TLV_LEN;

    let mut out = header(counter, total as u16);
    out.extend_from_slice(&SYNC_GREY.to_be_bytes());
    out.extend_from_slice(&(tlv_len as u16).to_be_bytes());
    out.extend_from_slice(&now.to_be_bytes());
    out.extend_from_slice(&ip.octets());
    out.extend_from_slice(&(from_len as u16).to_be_bytes());
    out.extend_from_slice(&(to_len as u16).to_be_bytes());
    out.extend_from_slice(&(helo_len as u16).to_be_bytes());
    out.extend_from_slice(from.as_bytes());
    out.push(0);
    out.extend_from_slice(to.as_bytes());
    out.push(0);
    out.extend_from_slice(helo.as_bytes());
    out.push(0);
    out.resize(SYNC_HEADER_LEN + tlv_len, 0);
    end_tlv(&mut out);

    seal(out, key)
}

/// Build an authenticated packet carrying a single address record.
pub fn build_addr(
    key: &[u8],
    counter: u32,
    tlv_type: u16,
    now: u32,
    expire: u32,
    ip: Ipv4Addr,
) -> Vec<u8> {
    let total = SYNC_HEADER_LEN + ADDR_TLV_LEN + END_TLV_LEN;

    let mut out = header(counter, total as u16);
    out.extend_from_slice(&tlv_type.to_be_bytes());
    out.extend_from_slice(&(ADDR_TLV_LEN as u16).to_be_bytes());
    out.extend_from_slice(&now.to_be_bytes());
    out.extend_from_slice(&expire.to_be_bytes());
    out.extend_from_slice(&ip.octets());
    end_tlv(&mut out);

    seal(out, key)
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn nul_str(buf: &[u8]) -> Result<String, SyncError> {
    let nul = buf.iter().position(|&b| b == 0).ok_or(SyncError::Truncated)?;
    std::str::from_utf8(&buf[..nul])
        .map(ToString::to_string)
        .map_err(|_| SyncError::Truncated)
}

/// Verify a received packet and decode its records. Any structural problem
/// aborts the whole packet.
pub fn parse(key: &[u8], buf: &[u8]) -> Result<Vec<SyncRecord>, SyncError> {
    if buf.len() < SYNC_HEADER_LEN {
        return Err(SyncError::Truncated);
    }
    if buf[0] != SYNC_VERSION {
        return Err(SyncError::BadVersion(buf[0]));
    }
    if buf[1] != SYNC_AF_INET {
        return Err(SyncError::BadAddressFamily(buf[1]));
    }
    let length = usize::from(be16(buf, 6));
    if length < SYNC_HEADER_LEN || buf.len() < length {
        return Err(SyncError::Truncated);
    }

    let mut zeroed = buf[..length].to_vec();
    let claimed: Vec<u8> = zeroed[8..8 + SYNC_HMAC_LEN].to_vec();
    zeroed[8..8 + SYNC_HMAC_LEN].fill(0);

    let mut mac = HmacSha1::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC-SHA1 accepts any key length"));
    mac.update(&zeroed);
    let expected = mac.finalize().into_bytes();
    if claimed.as_slice() != expected.as_slice() {
        return Err(SyncError::BadHmac);
    }

    let mut records = Vec::new();
    let mut at = SYNC_HEADER_LEN;

    while at < length {
        if length - at < 4 {
            return Err(SyncError::Truncated);
        }
        let tlv_type = be16(buf, at);
        let tlv_len = usize::from(be16(buf, at + 2));
        if tlv_len < 4 || tlv_len > length - at {
            return Err(SyncError::Truncated);
        }

        match tlv_type {
            SYNC_END => return Ok(records),
            SYNC_GREY => {
                if tlv_len < GREY_FIXED_LEN {
                    return Err(SyncError::Truncated);
                }
                let timestamp = be32(buf, at + 4);
                let ip = Ipv4Addr::new(buf[at + 8], buf[at + 9], buf[at + 10], buf[at + 11]);
                let from_len = usize::from(be16(buf, at + 12));
                let to_len = usize::from(be16(buf, at + 14));
                let helo_len = usize::from(be16(buf, at + 16));
                if GREY_FIXED_LEN + from_len + to_len + helo_len > tlv_len {
                    return Err(SyncError::Truncated);
                }

                let strings = &buf[at + GREY_FIXED_LEN..at + tlv_len];
                let from = nul_str(&strings[..from_len])?;
                let to = nul_str(&strings[from_len..from_len + to_len])?;
                let helo = nul_str(&strings[from_len + to_len..from_len + to_len + helo_len])?;

                records.push(SyncRecord::Grey {
                    timestamp,
                    ip,
                    from,
                    to,
                    helo,
                });
            }
            SYNC_WHITE | SYNC_TRAPPED | SYNC_DEL_WHITE | SYNC_DEL_TRAPPED => {
                if tlv_len != ADDR_TLV_LEN {
                    return Err(SyncError::Truncated);
                }
                let kind = if tlv_type == SYNC_WHITE || tlv_type == SYNC_DEL_WHITE {
                    AddrKind::White
                } else {
                    AddrKind::Trapped
                };
                records.push(SyncRecord::Addr {
                    kind,
                    delete: tlv_type == SYNC_DEL_WHITE || tlv_type == SYNC_DEL_TRAPPED,
                    timestamp: be32(buf, at + 4),
                    expire: be32(buf, at + 8),
                    ip: Ipv4Addr::new(buf[at + 12], buf[at + 13], buf[at + 14], buf[at + 15]),
                });
            }
            other => return Err(SyncError::UnknownTlv(other)),
        }

        at += tlv_len;
    }

    Ok(records)
}
