use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A recomputed checksum that disagrees with the transmitted one.
///
/// `found` is what the datagram carried, `expected` what RFC 1071 gives
/// for the same bytes with the checksum field zeroed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("InvalidChecksumError: found 0x{found:04x}, expected 0x{expected:04x}")]
pub struct ChecksumError {
    pub found: u16,
    pub expected: u16,
}

/// Why a single datagram was dropped. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("MalformedHeaderError: {what} needs {needed} bytes, got {got}")]
    Malformed {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error(transparent)]
    InvalidChecksum(#[from] ChecksumError),
}

#[derive(Error, Debug)]
pub enum LogPingsError {
    #[error("cannot resolve listen address {0}")]
    Resolve(String),

    #[error("cannot open raw ICMP socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("not a present directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("{call} failed: {source}")]
    Harden {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("socket error: {0}")]
    Receive(#[source] io::Error),

    #[error("cannot install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("cannot open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("logger setup failed: {0}")]
    Logger(#[from] log::SetLoggerError),
}

pub type Result<T> = std::result::Result<T, LogPingsError>;
