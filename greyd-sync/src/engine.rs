//! Sync engine: one UDP socket, a list of unicast peers, and optionally an
//! IPv4 multicast group. Every local whitelist/trap/grey mutation is
//! broadcast; received packets are verified and fed back to the greylister
//! as pipe records flagged `sync = 0` so they are not re-broadcast.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};

use greyd_common::config::SyncConfig;
use greyd_common::pipe::{AddrEvent, GreyEvent};
use sha1::{Digest, Sha1};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::packet::{
    self, AddrKind, SYNC_DEL_TRAPPED, SYNC_DEL_WHITE, SYNC_MAXSIZE, SYNC_TRAPPED, SYNC_WHITE,
    SyncRecord,
};
use crate::SyncError;

/// Derive the shared HMAC key from the raw key file contents: the
/// lower-case hex of its SHA1 digest. Legacy peers hashed the file with an
/// external helper, so the digest text, not the file bytes, is the wire
/// key.
pub fn derive_key(raw: &[u8]) -> Vec<u8> {
    let digest = Sha1::digest(raw);
    let mut key = String::with_capacity(40);
    for byte in digest {
        key.push_str(&format!("{byte:02x}"));
    }
    key.into_bytes()
}

#[derive(Debug)]
pub struct SyncEngine {
    socket: UdpSocket,
    hosts: Vec<SocketAddr>,
    mcast: Option<SocketAddrV4>,
    /// Local interface address; our own multicast loopback is dropped.
    local_addr: Option<Ipv4Addr>,
    key: Vec<u8>,
    counter: AtomicU32,
}

impl SyncEngine {
    /// Build the engine from configuration. Returns `None` when sync is
    /// disabled.
    pub fn from_config(config: &SyncConfig) -> Result<Option<Self>, SyncError> {
        if !config.enable {
            return Ok(None);
        }

        let key = if config.verify {
            match std::fs::read(&config.key) {
                Ok(raw) => derive_key(&raw),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(err) => return Err(err.into()),
            }
        } else {
            Vec::new()
        };

        let bind_addr = match &config.bind_address {
            Some(raw) => Some(
                raw.parse::<Ipv4Addr>()
                    .map_err(|_| SyncError::InvalidAddress(raw.clone()))?,
            ),
            None => None,
        };

        let mut hosts = Vec::new();
        for name in &config.hosts {
            let resolved = (name.as_str(), config.port)
                .to_socket_addrs()
                .map_err(|_| SyncError::Resolve(name.clone()))?
                .find(SocketAddr::is_ipv4)
                .ok_or_else(|| SyncError::Resolve(name.clone()))?;
            debug!(host = %name, addr = %resolved, "added sync host");
            hosts.push(resolved);
        }

        let mcast = match &config.mcast_address {
            Some(raw) => {
                let group: Ipv4Addr = raw
                    .parse()
                    .map_err(|_| SyncError::InvalidAddress(raw.clone()))?;
                Some(SocketAddrV4::new(group, config.port))
            }
            None => None,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let bind_to = SocketAddrV4::new(bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED), config.port);
        socket.bind(&SocketAddr::V4(bind_to).into())?;

        if let Some(mcast) = &mcast {
            let iface = bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket.join_multicast_v4(mcast.ip(), &iface)?;
            socket.set_multicast_ttl_v4(config.ttl)?;
            debug!(group = %mcast.ip(), ttl = config.ttl, port = config.port,
                "using multicast spam sync mode");
        }

        let socket = UdpSocket::from_std(socket.into())?;

        Ok(Some(Self {
            socket,
            hosts,
            mcast,
            local_addr: bind_addr,
            key,
            counter: AtomicU32::new(0),
        }))
    }

    fn next_counter(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Only IPv4 addresses travel on the wire; the packet format has no
    /// IPv6 address family.
    fn parse_v4(ip: &str) -> Option<Ipv4Addr> {
        match ip.parse::<Ipv4Addr>() {
            Ok(v4) => Some(v4),
            Err(_) => {
                debug!(%ip, "skipping sync of non-IPv4 address");
                None
            }
        }
    }

    async fn send(&self, packet: &[u8]) {
        if let Some(mcast) = &self.mcast {
            debug!("sending multicast sync message");
            if let Err(err) = self.socket.send_to(packet, SocketAddr::V4(*mcast)).await {
                warn!(%err, "multicast sync send failed");
            }
        }
        for host in &self.hosts {
            debug!(%host, "sending sync message");
            if let Err(err) = self.socket.send_to(packet, host).await {
                warn!(%host, %err, "sync send failed");
            }
        }
    }

    pub async fn send_grey(&self, now: i64, ip: &str, from: &str, to: &str, helo: &str) {
        let Some(v4) = Self::parse_v4(ip) else { return };
        debug!(%helo, %ip, %from, %to, "sync grey update");
        let packet = packet::build_grey(
            &self.key,
            self.next_counter(),
            now as u32,
            v4,
            from,
            to,
            helo,
        );
        self.send(&packet).await;
    }

    pub async fn send_white(&self, ip: &str, now: i64, expire: i64, delete: bool) {
        let Some(v4) = Self::parse_v4(ip) else { return };
        let tlv_type = if delete { SYNC_DEL_WHITE } else { SYNC_WHITE };
        debug!(%ip, delete, "sync white");
        let packet = packet::build_addr(
            &self.key,
            self.next_counter(),
            tlv_type,
            now as u32,
            expire as u32,
            v4,
        );
        self.send(&packet).await;
    }

    pub async fn send_trapped(&self, ip: &str, now: i64, expire: i64, delete: bool) {
        let Some(v4) = Self::parse_v4(ip) else { return };
        let tlv_type = if delete { SYNC_DEL_TRAPPED } else { SYNC_TRAPPED };
        debug!(%ip, delete, "sync trapped");
        let packet = packet::build_addr(
            &self.key,
            self.next_counter(),
            tlv_type,
            now as u32,
            expire as u32,
            v4,
        );
        self.send(&packet).await;
    }

    /// Receive one datagram and decode it into grey-pipe events. Returns an
    /// empty list for packets that must be ignored (own loopback, bad HMAC,
    /// malformed).
    pub async fn recv_events(&self) -> Result<Vec<GreyEvent>, SyncError> {
        let mut buf = [0u8; SYNC_MAXSIZE];
        let (len, peer) = self.socket.recv_from(&mut buf).await?;

        let src_ip = match peer.ip() {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return Ok(Vec::new()),
        };
        if self.local_addr.is_some_and(|local| local == src_ip) {
            return Ok(Vec::new());
        }

        match packet::parse(&self.key, &buf[..len]) {
            Ok(records) => {
                debug!(src = %src_ip, bytes = len, "received sync packet");
                Ok(records
                    .into_iter()
                    .map(|record| record_to_event(record, src_ip))
                    .collect())
            }
            Err(err) => {
                debug!(src = %src_ip, %err, "dropping sync packet");
                Ok(Vec::new())
            }
        }
    }
}

/// Re-express a verified sync record as the equivalent grey-pipe event,
/// with `sync` cleared to stop re-broadcast.
pub fn record_to_event(record: SyncRecord, src_ip: Ipv4Addr) -> GreyEvent {
    match record {
        SyncRecord::Grey {
            ip,
            from,
            to,
            helo,
            timestamp: _,
        } => GreyEvent::Grey {
            dst_ip: None,
            ip: ip.to_string(),
            helo,
            from,
            to,
            sync: false,
        },
        SyncRecord::Addr {
            kind,
            delete,
            expire,
            ip,
            timestamp: _,
        } => {
            let addr = AddrEvent {
                ip: ip.to_string(),
                source: src_ip.to_string(),
                expires: i64::from(expire),
                delete,
                sync: false,
            };
            match kind {
                AddrKind::White => GreyEvent::White(addr),
                AddrKind::Trapped => GreyEvent::Trap(addr),
            }
        }
    }
}
