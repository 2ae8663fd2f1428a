//! Grey-pipe event model and framing.
//!
//! The connection engine and the sync receiver both feed the greylister
//! through a single framed byte stream; the stream order is the order in
//! which database mutations are applied. A record is a run of `key = value`
//! lines terminated by a line holding only `%`.

use std::fmt::Write as _;

use crate::error::FrameError;

pub const GREY_MSG_GREY: i64 = 1;
pub const GREY_MSG_WHITE: i64 = 2;
pub const GREY_MSG_TRAP: i64 = 3;

/// A whitelist or trap mutation carried over the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrEvent {
    pub ip: String,
    /// Address of the host that originated the mutation.
    pub source: String,
    pub expires: i64,
    pub delete: bool,
    /// When false the greylister must not re-broadcast this mutation.
    pub sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GreyEvent {
    Grey {
        /// Local address the peer connected to; absent on replicated events.
        dst_ip: Option<String>,
        ip: String,
        helo: String,
        from: String,
        to: String,
        sync: bool,
    },
    White(AddrEvent),
    Trap(AddrEvent),
}

impl GreyEvent {
    pub const fn type_code(&self) -> i64 {
        match self {
            Self::Grey { .. } => GREY_MSG_GREY,
            Self::White(_) => GREY_MSG_WHITE,
            Self::Trap(_) => GREY_MSG_TRAP,
        }
    }

    /// Render the framed text form, terminator included.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "type = {}", self.type_code());

        match self {
            Self::Grey {
                dst_ip,
                ip,
                helo,
                from,
                to,
                sync,
            } => {
                if !sync {
                    out.push_str("sync = 0\n");
                }
                if let Some(dst_ip) = dst_ip {
                    let _ = writeln!(out, "dst_ip = \"{dst_ip}\"");
                }
                let _ = writeln!(out, "ip = \"{ip}\"");
                let _ = writeln!(out, "helo = \"{helo}\"");
                let _ = writeln!(out, "from = \"{from}\"");
                let _ = writeln!(out, "to = \"{to}\"");
            }
            Self::White(addr) | Self::Trap(addr) => {
                if !addr.sync {
                    out.push_str("sync = 0\n");
                }
                let _ = writeln!(out, "ip = \"{}\"", addr.ip);
                let _ = writeln!(out, "source = \"{}\"", addr.source);
                let _ = writeln!(out, "expires = \"{}\"", addr.expires);
                let _ = writeln!(out, "delete = {}", u8::from(addr.delete));
            }
        }

        out.push_str("%\n");
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Int(i64),
}

impl Value {
    fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Int(_) => None,
        }
    }

    fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            // Timestamps arrive as quoted decimal strings.
            Self::Str(s) => s.parse().ok(),
        }
    }
}

/// Incremental parser: feed one line at a time; a completed record yields
/// an event.
#[derive(Debug, Default)]
pub struct FrameParser {
    fields: Vec<(String, Value)>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_line(&mut self, line: &str) -> Result<Option<GreyEvent>, FrameError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(None);
        }
        if line == "%" {
            let event = self.finish()?;
            return Ok(Some(event));
        }

        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| FrameError::MalformedLine(line.to_string()))?;
        let key = key.trim().to_string();
        let raw = value.trim();

        let value = if let Some(stripped) = raw.strip_prefix('"') {
            let inner = stripped
                .strip_suffix('"')
                .ok_or_else(|| FrameError::MalformedLine(line.to_string()))?;
            Value::Str(inner.to_string())
        } else {
            Value::Int(
                raw.parse()
                    .map_err(|_| FrameError::MalformedLine(line.to_string()))?,
            )
        };

        self.fields.push((key, value));
        Ok(None)
    }

    fn take(&mut self, key: &'static str) -> Option<Value> {
        let pos = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(pos).1)
    }

    fn take_str(&mut self, key: &'static str) -> Result<String, FrameError> {
        self.take(key)
            .and_then(|v| v.as_str().map(ToString::to_string))
            .ok_or(FrameError::MissingField(key))
    }

    fn finish(&mut self) -> Result<GreyEvent, FrameError> {
        let result = self.build();
        self.fields.clear();
        result
    }

    fn build(&mut self) -> Result<GreyEvent, FrameError> {
        let code = self
            .take("type")
            .and_then(|v| v.as_int())
            .ok_or(FrameError::MissingField("type"))?;
        let sync = self
            .take("sync")
            .and_then(|v| v.as_int())
            .is_none_or(|v| v != 0);

        match code {
            GREY_MSG_GREY => Ok(GreyEvent::Grey {
                dst_ip: self.take("dst_ip").and_then(|v| v.as_str().map(ToString::to_string)),
                ip: self.take_str("ip")?,
                helo: self.take_str("helo")?,
                from: self.take_str("from")?,
                to: self.take_str("to")?,
                sync,
            }),
            GREY_MSG_WHITE | GREY_MSG_TRAP => {
                let addr = AddrEvent {
                    ip: self.take_str("ip")?,
                    source: self.take_str("source")?,
                    expires: self
                        .take("expires")
                        .and_then(|v| v.as_int())
                        .ok_or(FrameError::MissingField("expires"))?,
                    delete: self
                        .take("delete")
                        .and_then(|v| v.as_int())
                        .is_some_and(|v| v != 0),
                    sync,
                };
                if code == GREY_MSG_WHITE {
                    Ok(GreyEvent::White(addr))
                } else {
                    Ok(GreyEvent::Trap(addr))
                }
            }
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<GreyEvent> {
        let mut parser = FrameParser::new();
        let mut events = Vec::new();
        for line in text.lines() {
            if let Some(event) = parser.feed_line(line).unwrap() {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn grey_round_trip() {
        let event = GreyEvent::Grey {
            dst_ip: Some("2.3.4.5".to_string()),
            ip: "1.2.3.4".to_string(),
            helo: "jackiemclean.net".to_string(),
            from: "m@jackiemclean.net".to_string(),
            to: "r@domain1.com".to_string(),
            sync: true,
        };
        let text = event.encode();
        assert!(text.starts_with("type = 1\n"));
        assert!(text.ends_with("%\n"));
        assert_eq!(parse(&text), vec![event]);
    }

    #[test]
    fn white_round_trip() {
        let event = GreyEvent::White(AddrEvent {
            ip: "4.3.2.1".to_string(),
            source: "2.3.4.5".to_string(),
            expires: 1700000000,
            delete: false,
            sync: false,
        });
        let text = event.encode();
        assert!(text.contains("sync = 0\n"));
        assert!(text.contains("expires = \"1700000000\"\n"));
        assert_eq!(parse(&text), vec![event]);
    }

    #[test]
    fn sync_defaults_on_when_absent() {
        let events = parse(
            "type = 2\nip = \"4.3.2.1\"\nsource = \"2.3.4.5\"\nexpires = \"3600\"\n%\n",
        );
        match &events[0] {
            GreyEvent::White(addr) => {
                assert!(addr.sync);
                assert!(!addr.delete);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn multiple_records_in_one_stream() {
        let mut text = GreyEvent::Trap(AddrEvent {
            ip: "3.4.2.1".to_string(),
            source: "3.2.4.5".to_string(),
            expires: 10,
            delete: true,
            sync: true,
        })
        .encode();
        text.push_str(
            "type = 1\nsync = 0\nip = \"1.1.1.1\"\nhelo = \"h\"\nfrom = \"f@x\"\nto = \"t@y\"\n%\n",
        );
        let events = parse(&text);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], GreyEvent::Trap(_)));
        assert!(matches!(
            events[1],
            GreyEvent::Grey { ref dst_ip, sync: false, .. } if dst_ip.is_none()
        ));
    }

    #[test]
    fn malformed_line_is_an_error() {
        let mut parser = FrameParser::new();
        assert!(parser.feed_line("==").is_err());
        assert!(parser.feed_line("type = \"unterminated").is_err());
    }

    #[test]
    fn unknown_type_is_an_error() {
        let mut parser = FrameParser::new();
        parser.feed_line("type = 9").unwrap();
        assert!(parser.feed_line("%").is_err());
    }
}
