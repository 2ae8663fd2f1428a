//! Periodic database scan: expiry, promotion, and the two downstream
//! payloads (whitelist set replacement for the firewall, traplist for the
//! blacklist loader).

use greyd_db::{Handle, ScanOutcome};
use greyd_fw::{Af, FwMessage};
use tracing::debug;

use crate::GreyError;
use crate::greylister::{Broadcast, Greylister};

/// Firewall set addressed by whitelist replacements.
pub const WHITELIST_NAME: &str = "greyd-whitelist";

/// What one scan pass wants pushed downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEmit {
    /// Firewall payloads: IPv4 whitelist, IPv6 whitelist, traplist.
    pub messages: Vec<FwMessage>,
    /// Sync broadcasts for addresses promoted during this pass.
    pub broadcasts: Vec<Broadcast>,
}

/// Run one scan pass over the database.
pub fn scan_once(
    greylister: &Greylister,
    db: &mut Handle,
    now: i64,
) -> Result<ScanEmit, GreyError> {
    let white_exp = greylister.config().white_exp;
    let ScanOutcome {
        whitelist,
        whitelist_ipv6,
        traplist,
        promoted,
    } = db.scan(now, white_exp)?;

    debug!(
        white = whitelist.len(),
        white_v6 = whitelist_ipv6.len(),
        trapped = traplist.len(),
        promoted = promoted.len(),
        "scan complete"
    );

    let messages = vec![
        FwMessage::Replace {
            name: WHITELIST_NAME.to_string(),
            af: Af::Inet,
            ips: whitelist,
        },
        FwMessage::Replace {
            name: WHITELIST_NAME.to_string(),
            af: Af::Inet6,
            ips: whitelist_ipv6,
        },
        FwMessage::Traplist {
            name: greylister.config().traplist_name.clone(),
            message: greylister.config().traplist_message.clone(),
            ips: traplist,
        },
    ];

    let broadcasts = promoted
        .into_iter()
        .map(|ip| Broadcast::White {
            ip,
            expire: now + white_exp,
            delete: false,
        })
        .collect();

    Ok(ScanEmit {
        messages,
        broadcasts,
    })
}
