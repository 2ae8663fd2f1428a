use std::io;

use thiserror::Error;

/// Errors raised while parsing addresses and CIDR blocks.
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid CIDR prefix {prefix} for {addr}")]
    InvalidPrefix { addr: String, prefix: u8 },

    #[error("malformed CIDR: {0}")]
    Malformed(String),
}

/// Errors raised while loading the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Errors raised while decoding grey-pipe frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed line: {0:?}")]
    MalformedLine(String),

    #[error("unknown record type {0}")]
    UnknownType(i64),

    #[error("record is missing the {0:?} field")]
    MissingField(&'static str),
}
