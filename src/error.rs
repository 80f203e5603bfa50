//! Error taxonomy for the relay.
//!
//! Connection-scoped errors (`Io`, `PeerClosed`, `CacheFull`,
//! `UpstreamUnavailable`) are handled where they occur: the owning
//! endpoint is disconnected and the relay keeps running. Only
//! [`RelayError::is_fatal`] errors escape the reactor and end the process.

use std::fmt;
use std::io;

/// Errors produced by the codec, cache, reactor and relay engine.
#[derive(Debug)]
pub enum RelayError {
    /// Non-transient I/O failure on a descriptor.
    Io(io::Error),
    /// The peer closed the stream (zero-byte read).
    PeerClosed,
    /// A declared record length cannot fit the bounded read buffer.
    RecordTooLarge {
        /// Length declared in the record header.
        declared: usize,
        /// Configured maximum payload size.
        max: usize,
    },
    /// Storing a record would push the cache over its capacity.
    CacheFull {
        /// Bytes the rejected record needs (header included).
        needed: usize,
        /// Bytes still free in the cache.
        available: usize,
    },
    /// The readiness poll failed with something other than `EINTR`.
    Poll(io::Error),
    /// The upstream socket is missing or refused the connection.
    UpstreamUnavailable(String),
    /// A watch is already registered for this descriptor.
    WatchExists(i32),
    /// The reactor's watch table is full.
    WatchLimit(usize),
    /// Invalid configuration value.
    Config(String),
}

impl RelayError {
    /// Whether this error must terminate the process.
    ///
    /// A poll failure leaves the reactor unusable, and an oversized record
    /// means the size limit was configured wrong. Everything else is
    /// recoverable at the connection boundary.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RecordTooLarge { .. } | Self::Poll(_))
    }

    /// Whether this is an interrupted/would-block condition that callers retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => is_transient(e),
            _ => false,
        }
    }
}

/// `EINTR`/`EAGAIN` on send or receive are retried, never surfaced.
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PeerClosed => write!(f, "peer closed connection"),
            Self::RecordTooLarge { declared, max } => {
                write!(f, "record too large: {declared} bytes (max {max})")
            }
            Self::CacheFull { needed, available } => {
                write!(f, "cache full: need {needed} bytes, {available} available")
            }
            Self::Poll(e) => write!(f, "poll failed: {e}"),
            Self::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::WatchExists(fd) => write!(f, "descriptor {fd} already watched"),
            Self::WatchLimit(max) => write!(f, "watch table full ({max} entries)"),
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::Poll(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;
