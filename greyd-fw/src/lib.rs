//! Firewall driver boundary.
//!
//! The greylisting scan emits two kinds of messages: whitelist set
//! replacements and traplist loads. A driver is a value implementing
//! [`FwDriver`]; selection is by the `firewall.driver` configuration key.
//! The host-specific set plumbing (ipset, pf tables, nftables) lives behind
//! this trait and is not part of the core.

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum FwError {
    #[error("unknown firewall driver {0:?}")]
    UnknownDriver(String),

    #[error("firewall update failed: {0}")]
    Update(String),
}

/// Address family tag carried on whitelist messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Af {
    Inet,
    Inet6,
}

impl fmt::Display for Af {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet => f.write_str("AF_INET"),
            Self::Inet6 => f.write_str("AF_INET6"),
        }
    }
}

/// A message for the firewall loader, rendered in the config-value text
/// format at the driver boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FwMessage {
    /// Replace the named set with exactly these addresses.
    Replace {
        name: String,
        af: Af,
        ips: Vec<String>,
    },
    /// Load the named traplist, with its rejection message, as a blacklist.
    Traplist {
        name: String,
        message: String,
        ips: Vec<String>,
    },
}

impl fmt::Display for FwMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = |ips: &[String]| {
            ips.iter()
                .map(|ip| format!("\"{ip}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Self::Replace { name, af, ips } => {
                writeln!(f, "name = \"{name}\"")?;
                writeln!(f, "af = {af}")?;
                writeln!(f, "ips = [ {} ]", quote(ips))
            }
            Self::Traplist { name, message, ips } => {
                writeln!(f, "name = \"{name}\"")?;
                writeln!(f, "message = \"{message}\"")?;
                writeln!(f, "ips = [ {} ]", quote(ips))
            }
        }
    }
}

/// Contract a firewall driver must satisfy.
pub trait FwDriver: Send {
    /// Replace the named set with the given addresses for one family.
    fn replace(&mut self, name: &str, af: Af, ips: &[String]) -> Result<(), FwError>;

    /// Install the traplist as a rejecting blacklist set.
    fn load_traplist(&mut self, name: &str, message: &str, ips: &[String]) -> Result<(), FwError>;

    fn apply(&mut self, message: &FwMessage) -> Result<(), FwError> {
        match message {
            FwMessage::Replace { name, af, ips } => self.replace(name, *af, ips),
            FwMessage::Traplist { name, message, ips } => self.load_traplist(name, message, ips),
        }
    }
}

/// Driver that only records what it would have installed. The default on
/// platforms without set support, and the assertion point in tests.
#[derive(Debug, Default, Clone)]
pub struct LogDriver {
    applied: Arc<Mutex<Vec<FwMessage>>>,
}

impl LogDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<FwMessage> {
        match self.applied.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, message: FwMessage) {
        info!(%message, "firewall update");
        match self.applied.lock() {
            Ok(mut guard) => guard.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
    }
}

impl FwDriver for LogDriver {
    fn replace(&mut self, name: &str, af: Af, ips: &[String]) -> Result<(), FwError> {
        self.record(FwMessage::Replace {
            name: name.to_string(),
            af,
            ips: ips.to_vec(),
        });
        Ok(())
    }

    fn load_traplist(&mut self, name: &str, message: &str, ips: &[String]) -> Result<(), FwError> {
        self.record(FwMessage::Traplist {
            name: name.to_string(),
            message: message.to_string(),
            ips: ips.to_vec(),
        });
        Ok(())
    }
}

/// Instantiate the configured driver.
pub fn from_config(driver: &str) -> Result<Box<dyn FwDriver>, FwError> {
    match driver {
        "log" => Ok(Box::new(LogDriver::new())),
        other => Err(FwError::UnknownDriver(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_message_renders_config_value_format() {
        let message = FwMessage::Replace {
            name: "greyd-whitelist".to_string(),
            af: Af::Inet,
            ips: vec!["1.2.3.4".to_string(), "4.3.2.1".to_string()],
        };
        assert_eq!(
            message.to_string(),
            "name = \"greyd-whitelist\"\naf = AF_INET\nips = [ \"1.2.3.4\", \"4.3.2.1\" ]\n"
        );
    }

    #[test]
    fn traplist_message_renders_config_value_format() {
        let message = FwMessage::Traplist {
            name: "test traplist".to_string(),
            message: "you have been trapped".to_string(),
            ips: vec!["3.4.2.1".to_string()],
        };
        assert_eq!(
            message.to_string(),
            "name = \"test traplist\"\nmessage = \"you have been trapped\"\nips = [ \"3.4.2.1\" ]\n"
        );
    }

    #[test]
    fn log_driver_records_applied_messages() {
        let driver = LogDriver::new();
        let mut boxed: Box<dyn FwDriver> = Box::new(driver.clone());
        boxed
            .apply(&FwMessage::Replace {
                name: "greyd-whitelist".to_string(),
                af: Af::Inet6,
                ips: vec!["2001::1".to_string()],
            })
            .unwrap();

        let applied = driver.applied();
        assert_eq!(applied.len(), 1);
        assert!(matches!(&applied[0], FwMessage::Replace { af: Af::Inet6, .. }));
    }

    #[test]
    fn unknown_driver_is_rejected() {
        assert!(from_config("nftables-9000").is_err());
    }
}
