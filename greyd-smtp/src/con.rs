//! Per-connection SMTP state machine.
//!
//! One `Con` lives for the lifetime of an accepted peer. All I/O is
//! non-blocking: `handle_read`/`handle_write` are called when the socket
//! signals readiness and take the current time explicitly, so the pacing
//! behaviour can be driven by an externally advanced clock.
//!
//! Blacklisted peers are stuttered: the reply drains one byte at a time
//! with `stutter` seconds between bytes, and every bare `\n` is expanded to
//! `\r\n` on the wire. Unknown peers get the canonical temporary failure
//! and a greylist event on the pipe.

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use greyd_blacklist::{Blacklist, Registry};
use greyd_common::addr::Addr;
use greyd_common::config::Config;
use greyd_common::pipe::GreyEvent;
use greyd_common::{incoming, internal, outgoing};

pub const OUT_BUF_SIZE: usize = 8192;
pub const IN_BUF_SIZE: usize = 8192;

/// Width budget for the human-readable matched-lists summary.
const LIST_SUMMARY_WIDTH: usize = 80;

/// Headroom under `max_cons` required to keep stuttering.
const CLIENT_TOLERANCE: usize = 5;

const REPLY_HELO: &str = "250 Hello, spam sender. Pleased to be wasting your time.\r\n";
const REPLY_MAIL: &str =
    "250 You are about to try to deliver spam. Your time will be spent, for nothing.\r\n";
const REPLY_RCPT: &str = "250 This is hurting you more than it is hurting me.\r\n";
const REPLY_DATA: &str = "354 Enter spam, end with \".\" on a line by itself\r\n";
const REPLY_GENERIC: &str = "250 Ok\r\n";
const REPLY_QUIT: &str = "221 Bye\r\n";
const REPLY_TEMPFAIL: &str = "451 Temporary failure, please try again later.\r\n";

/// Shared connection accounting.
#[derive(Debug, Clone, Copy)]
pub struct GreydState {
    pub max_cons: usize,
    pub max_black: usize,
    pub clients: usize,
    pub black_clients: usize,
}

impl GreydState {
    pub const fn new(max_cons: usize, max_black: usize) -> Self {
        Self {
            max_cons,
            max_black,
            clients: 0,
            black_clients: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Banner,
    HeloIn,
    HeloOut,
    MailIn,
    MailOut,
    RcptIn,
    RcptOut,
    DataIn,
    DataOut,
    Message,
    Reply,
    Close,
}

impl State {
    const fn is_reading(self) -> bool {
        matches!(
            self,
            Self::HeloIn | Self::MailIn | Self::RcptIn | Self::DataIn | Self::Message
        )
    }
}

fn banner_line(hostname: &str, banner: &str, now: i64) -> String {
    let date = DateTime::<Utc>::from_timestamp(now, 0)
        .map(|dt| dt.format("%a %b %e %H:%M:%S %Y").to_string())
        .unwrap_or_default();
    format!("220 {hostname} ESMTP {banner}; {date}\r\n")
}

fn summarize_lists(lists: &[Arc<Blacklist>]) -> Option<String> {
    if lists.is_empty() {
        return None;
    }
    let mut out = String::new();
    for bl in lists {
        let extra = bl.name.len() + usize::from(!out.is_empty());
        if out.len() + extra + 4 > LIST_SUMMARY_WIDTH {
            out.push_str(" ...");
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&bl.name);
    }
    Some(out)
}

/// Lower-case an envelope address and strip angle brackets and whitespace.
fn normalize_addr(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}

pub struct Con<S> {
    stream: S,
    pub src_addr: String,
    dst_addr: Option<String>,
    state: State,
    /// Timestamps: last read readiness, next write due, session start.
    pub r: i64,
    pub w: i64,
    pub s: i64,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    out_pos: usize,
    wrote_cr: bool,
    helo: Option<String>,
    mail: Option<String>,
    rcpt: Option<String>,
    stutter: i64,
    blacklists: Vec<Arc<Blacklist>>,
    /// Summary of matched list names, width-capped.
    pub lists: Option<String>,
    error: bool,
    quit: bool,
    closed: bool,
    grey_enabled: bool,
    reply_code: u16,
    events: Vec<GreyEvent>,
}

impl<S: Read + Write> Con<S> {
    pub fn new(
        stream: S,
        src: IpAddr,
        dst: Option<IpAddr>,
        config: &Config,
        registry: &Registry,
        gs: &mut GreydState,
        now: i64,
    ) -> Self {
        let addr = Addr::from(src);
        let blacklists = registry.matching(&addr);
        let blacklisted = !blacklists.is_empty();

        gs.clients += 1;
        if blacklisted {
            gs.black_clients += 1;
        }

        let mut stutter = if blacklisted && config.grey.enable {
            config.grey.stutter
        } else {
            0
        };
        if blacklisted && gs.black_clients > gs.max_black {
            // Over the tarpit cap; drain this one fast to free the slot.
            stutter = 0;
        }

        let lists = summarize_lists(&blacklists);
        let reply_code = blacklists.first().map_or(450, |bl| bl.code);
        let banner = banner_line(&config.hostname, &config.banner, now);

        internal!(
            level = DEBUG,
            "connection accepted from {src}, lists {}, stutter {stutter}",
            lists.as_deref().unwrap_or("-")
        );

        Self {
            stream,
            src_addr: src.to_string(),
            dst_addr: dst.map(|ip| ip.to_string()),
            state: State::Banner,
            r: now,
            w: now + stutter,
            s: now,
            in_buf: Vec::new(),
            out_buf: banner.into_bytes(),
            out_pos: 0,
            wrote_cr: false,
            helo: None,
            mail: None,
            rcpt: None,
            stutter,
            blacklists,
            lists,
            error: false,
            quit: false,
            closed: false,
            grey_enabled: config.grey.enable,
            reply_code,
            events: Vec::new(),
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    pub const fn is_blacklisted(&self) -> bool {
        !self.blacklists.is_empty()
    }

    pub const fn stutter(&self) -> i64 {
        self.stutter
    }

    pub const fn reply_code(&self) -> u16 {
        self.reply_code
    }

    pub fn helo(&self) -> Option<&str> {
        self.helo.as_deref()
    }

    pub fn mail(&self) -> Option<&str> {
        self.mail.as_deref()
    }

    pub fn rcpt(&self) -> Option<&str> {
        self.rcpt.as_deref()
    }

    pub fn out_remaining(&self) -> usize {
        self.out_buf.len() - self.out_pos
    }

    pub fn has_output(&self) -> bool {
        self.out_remaining() > 0
    }

    pub const fn done(&self) -> bool {
        matches!(self.state, State::Close)
    }

    pub const fn had_error(&self) -> bool {
        self.error
    }

    /// Greylist events observed since the last call.
    pub fn take_events(&mut self) -> Vec<GreyEvent> {
        std::mem::take(&mut self.events)
    }

    /// Inactivity check against the configured window.
    pub const fn past_deadline(&self, now: i64, timeout: i64) -> bool {
        now - self.r > timeout
    }

    /// Release the connection slot and drop buffers. The slot may be reused
    /// for a new accept.
    pub fn close(&mut self, gs: &mut GreydState) {
        if self.closed {
            return;
        }
        self.closed = true;
        gs.clients -= 1;
        if !self.blacklists.is_empty() {
            gs.black_clients -= 1;
        }
        self.blacklists.clear();
        self.lists = None;
        self.in_buf.clear();
        self.out_buf.clear();
        self.out_pos = 0;
        self.state = State::Close;
    }

    fn set_out(&mut self, text: &str) {
        outgoing!("{}", text.trim_end_matches(['\r', '\n']));
        let mut bytes = text.as_bytes().to_vec();
        bytes.truncate(OUT_BUF_SIZE);
        self.out_buf = bytes;
        self.out_pos = 0;
        self.wrote_cr = false;
    }

    /// Queue a reply and schedule its first byte.
    fn reply(&mut self, text: &str, now: i64) {
        self.set_out(text);
        self.w = now + self.stutter;
    }

    /// Compose the final reply. Blacklisted peers get every matching
    /// list's message with `%A` expanded, joined with SMTP continuation
    /// prefixes; anyone else gets the fixed temporary failure, whatever
    /// code was asked for.
    pub fn build_reply(&mut self, code: &str) {
        if self.blacklists.is_empty() {
            self.set_out(REPLY_TEMPFAIL);
        } else {
            let mut lines: Vec<String> = Vec::new();
            for bl in &self.blacklists {
                let msg = bl.message.replace("%A", &self.src_addr).replace("\\n", "\n");
                lines.extend(msg.split('\n').map(ToString::to_string));
            }
            let mut text = String::new();
            let last = lines.len().saturating_sub(1);
            for (at, line) in lines.iter().enumerate() {
                let joiner = if at == last { ' ' } else { '-' };
                text.push_str(code);
                text.push(joiner);
                text.push_str(line);
                text.push('\n');
            }
            self.set_out(&text);
        }
        self.state = State::Reply;
    }

    pub fn handle_read(&mut self, now: i64) {
        self.r = now;
        let mut chunk = [0u8; 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.state = State::Close;
                    return;
                }
                Ok(n) => {
                    self.in_buf.extend_from_slice(&chunk[..n]);
                    if self.in_buf.len() > IN_BUF_SIZE {
                        // Input overrun.
                        self.error = true;
                        self.state = State::Close;
                        return;
                    }
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.state = State::Close;
                    return;
                }
            }
        }
        self.process_lines(now);
    }

    fn process_lines(&mut self, now: i64) {
        while self.state.is_reading() && !self.has_output() {
            let Some(pos) = self.in_buf.iter().position(|&b| b == b'\n') else {
                return;
            };
            let raw: Vec<u8> = self.in_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            self.process_line(&line, now);
        }
    }

    fn process_line(&mut self, line: &str, now: i64) {
        incoming!("{line}");

        let verb = line
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        if verb == "QUIT" {
            self.quit = true;
            self.reply(REPLY_QUIT, now);
            return;
        }

        match self.state {
            State::HeloIn => {
                if verb == "HELO" || verb == "EHLO" {
                    let arg = line
                        .split_once(char::is_whitespace)
                        .map_or("", |(_, rest)| rest)
                        .trim();
                    self.helo = Some(arg.to_string());
                    self.state = State::HeloOut;
                    self.reply(REPLY_HELO, now);
                } else {
                    self.reply(REPLY_GENERIC, now);
                }
            }
            State::MailIn => {
                if verb == "MAIL" {
                    match line.split_once(':') {
                        Some((_, addr)) => {
                            self.mail = Some(normalize_addr(addr));
                            self.state = State::MailOut;
                            self.reply(REPLY_MAIL, now);
                        }
                        None => {
                            self.error = true;
                            self.state = State::Close;
                        }
                    }
                } else {
                    self.reply(REPLY_GENERIC, now);
                }
            }
            State::RcptIn | State::DataIn => match verb.as_str() {
                "RCPT" => match line.split_once(':') {
                    Some((_, addr)) => {
                        let rcpt = normalize_addr(addr);
                        self.emit_grey_event(&rcpt);
                        self.rcpt = Some(rcpt);
                        self.state = State::RcptOut;
                        self.reply(REPLY_RCPT, now);
                    }
                    None => {
                        self.error = true;
                        self.state = State::Close;
                    }
                },
                "DATA" => {
                    self.state = State::DataOut;
                    // Past the dialogue; the tarpit has done its work.
                    self.stutter = 0;
                    self.reply(REPLY_DATA, now);
                }
                _ => self.reply(REPLY_GENERIC, now),
            },
            State::Message => {
                if line == "." {
                    let code = self.reply_code.to_string();
                    self.build_reply(&code);
                    self.w = now + self.stutter;
                }
                // Message content is consumed, never stored.
            }
            _ => self.reply(REPLY_GENERIC, now),
        }
    }

    /// Record the completed tuple for the greylister. Only unlisted peers
    /// greylist, and only once the full (helo, from, rcpt) is known.
    fn emit_grey_event(&mut self, rcpt: &str) {
        if !self.blacklists.is_empty() || !self.grey_enabled {
            return;
        }
        let (Some(helo), Some(mail)) = (&self.helo, &self.mail) else {
            return;
        };
        self.events.push(GreyEvent::Grey {
            dst_ip: self.dst_addr.clone(),
            ip: self.src_addr.clone(),
            helo: helo.clone(),
            from: mail.clone(),
            to: rcpt.to_string(),
            sync: true,
        });
    }

    pub fn handle_write(&mut self, now: i64, gs: &GreydState) {
        if self.w > now || !self.has_output() {
            return;
        }

        let room_to_stutter = gs.clients + CLIENT_TOLERANCE < gs.max_cons;
        if self.stutter > 0 && room_to_stutter {
            self.write_stuttered(now);
        } else {
            self.write_bulk();
        }

        if !self.has_output() && !matches!(self.state, State::Close) {
            self.advance_after_write();
        }
    }

    /// One byte per call, expanding a bare `\n` to `\r\n`, with the next
    /// write pushed `stutter` seconds out.
    fn write_stuttered(&mut self, now: i64) {
        let cur = self.out_buf[self.out_pos];
        let result = if cur == b'\n' && !self.wrote_cr {
            self.stream.write(b"\r").map(|n| (n, false))
        } else {
            self.stream.write(&[cur]).map(|n| (n, true))
        };

        match result {
            Ok((0, _)) => {
                self.state = State::Close;
                return;
            }
            Ok((_, advanced)) => {
                if advanced {
                    self.out_pos += 1;
                    self.wrote_cr = cur == b'\r';
                } else {
                    self.wrote_cr = true;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => {
                self.state = State::Close;
                return;
            }
        }

        self.w = now + self.stutter;
    }

    /// Outside the stutter window the buffer drains in as few syscalls as
    /// the socket allows.
    fn write_bulk(&mut self) {
        while self.has_output() {
            match self.stream.write(&self.out_buf[self.out_pos..]) {
                Ok(0) => {
                    self.state = State::Close;
                    return;
                }
                Ok(n) => self.out_pos += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.state = State::Close;
                    return;
                }
            }
        }
    }

    fn advance_after_write(&mut self) {
        if self.quit {
            self.state = State::Close;
            return;
        }
        match self.state {
            State::Banner => self.state = State::HeloIn,
            State::HeloOut => self.state = State::MailIn,
            State::MailOut => self.state = State::RcptIn,
            State::RcptOut => self.state = State::DataIn,
            State::DataOut => self.state = State::Message,
            State::Reply => self.state = State::Close,
            // A generic reply drained; keep listening in the same state.
            _ => {}
        }
    }
}
