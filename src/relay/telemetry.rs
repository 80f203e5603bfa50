//! Introspection snapshot served on the debug socket.
//!
//! A debug client connects, sends one framed record whose payload is the
//! literal `debug`, and receives one framed record holding three endpoint
//! blocks (upstream, primary, secondary). Each block is eight big-endian
//! `u64` words:
//!
//! ```text
//! [fd | u64::MAX] [packets in] [packets out] [bytes in] [bytes out]
//! [status] [disconnects] [last activity, unix seconds | 0]
//! ```
//!
//! Traffic counters and last activity restart from zero whenever an
//! endpoint is torn down. `disconnects` is the exception: it counts those
//! teardowns over the whole process lifetime and is never reset.

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::framing::{self, Fill, StreamCursor};
use crate::relay::endpoint::{ConnStatus, Counters};

/// Request token understood by the debug socket.
pub const DEBUG_TOKEN: &[u8] = b"debug";

const WORDS_PER_BLOCK: usize = 8;
const BLOCK_LEN: usize = WORDS_PER_BLOCK * 8;

/// Encoded snapshot size.
pub const SNAPSHOT_LEN: usize = 3 * BLOCK_LEN;

/// Largest request a debug client may send.
const MAX_REQUEST: usize = 64;

/// Debug connections held open while waiting for their request.
pub(crate) const MAX_DEBUG_PEERS: usize = 4;

/// Counters of one endpoint plus its live descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointStats {
    /// Connected descriptor, if any.
    pub fd: Option<RawFd>,
    /// Traffic counters.
    pub counters: Counters,
}

impl EndpointStats {
    fn encode_into(&self, out: &mut Vec<u8>) {
        let c = &self.counters;
        let fd = self.fd.map_or(u64::MAX, |fd| fd as u64);
        let last = c.last_activity.map_or(0, |t| t.timestamp().max(0) as u64);
        for word in [
            fd,
            c.packets_in,
            c.packets_out,
            c.bytes_in,
            c.bytes_out,
            c.status.code(),
            c.disconnects,
            last,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
    }

    fn decode(block: &[u8]) -> Self {
        let mut words = [0u64; WORDS_PER_BLOCK];
        for (word, chunk) in words.iter_mut().zip(block.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = u64::from_be_bytes(bytes);
        }
        let [fd, packets_in, packets_out, bytes_in, bytes_out, status, disconnects, last] = words;
        Self {
            fd: (fd != u64::MAX).then_some(fd as RawFd),
            counters: Counters {
                packets_in,
                packets_out,
                bytes_in,
                bytes_out,
                last_activity: (last != 0)
                    .then(|| DateTime::<Utc>::from_timestamp(last as i64, 0))
                    .flatten(),
                status: ConnStatus::from_code(status),
                disconnects,
            },
        }
    }
}

/// Point-in-time copy of every endpoint's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    /// Upstream endpoint.
    pub upstream: EndpointStats,
    /// Primary (fission) client.
    pub primary: EndpointStats,
    /// Secondary (default) client.
    pub secondary: EndpointStats,
}

impl TelemetrySnapshot {
    /// Fixed-size wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SNAPSHOT_LEN);
        self.upstream.encode_into(&mut out);
        self.primary.encode_into(&mut out);
        self.secondary.encode_into(&mut out);
        out
    }

    /// Parse the wire form. `None` if `bytes` is not exactly [`SNAPSHOT_LEN`] long.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SNAPSHOT_LEN {
            return None;
        }
        let mut blocks = bytes.chunks_exact(BLOCK_LEN).map(EndpointStats::decode);
        Some(Self {
            upstream: blocks.next()?,
            primary: blocks.next()?,
            secondary: blocks.next()?,
        })
    }
}

/// What a debug peer has asked for so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebugRequest {
    /// No complete record yet; watch the peer again.
    Pending,
    /// The peer sent [`DEBUG_TOKEN`].
    Snapshot,
    /// The peer sent something else.
    Ignored,
}

/// An accepted debug connection waiting for its request.
///
/// The stream is non-blocking and read only when the reactor reports it
/// readable, so a silent peer never holds up relaying.
#[derive(Debug)]
pub(crate) struct DebugPeer {
    stream: UnixStream,
    cursor: StreamCursor,
}

impl DebugPeer {
    pub(crate) fn new(stream: UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            cursor: StreamCursor::new(MAX_REQUEST)?,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Consume whatever the peer has sent.
    ///
    /// Errors (EOF, oversized request) mean the peer should be dropped.
    pub(crate) fn poll_request(&mut self) -> Result<DebugRequest> {
        loop {
            if let Some(payload) = self.cursor.next_record() {
                if payload == DEBUG_TOKEN {
                    return Ok(DebugRequest::Snapshot);
                }
                log::debug!("[relay] ignoring debug request of {} bytes", payload.len());
                return Ok(DebugRequest::Ignored);
            }
            match self.cursor.fill(&mut self.stream)? {
                Fill::Data(_) => {}
                Fill::Drained => return Ok(DebugRequest::Pending),
            }
        }
    }

    /// Write `snapshot` and close the connection.
    pub(crate) fn reply(mut self, snapshot: &TelemetrySnapshot) -> Result<()> {
        framing::write_record(&mut self.stream, &snapshot.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn sample() -> TelemetrySnapshot {
        TelemetrySnapshot {
            upstream: EndpointStats {
                fd: Some(7),
                counters: Counters {
                    packets_in: 3,
                    packets_out: 4,
                    bytes_in: 120,
                    bytes_out: 64,
                    last_activity: DateTime::<Utc>::from_timestamp(1_700_000_000, 0),
                    status: ConnStatus::Connected,
                    disconnects: 1,
                },
            },
            primary: EndpointStats::default(),
            secondary: EndpointStats {
                fd: None,
                counters: Counters {
                    status: ConnStatus::Listening,
                    ..Counters::default()
                },
            },
        }
    }

    #[test]
    fn test_snapshot_layout() {
        let bytes = sample().encode();
        assert_eq!(bytes.len(), SNAPSHOT_LEN);
        // upstream fd
        assert_eq!(&bytes[..8], &7u64.to_be_bytes());
        // upstream status
        assert_eq!(&bytes[40..48], &2u64.to_be_bytes());
        // primary fd absent
        assert_eq!(&bytes[BLOCK_LEN..BLOCK_LEN + 8], &u64::MAX.to_be_bytes());
        assert_eq!(TelemetrySnapshot::decode(&bytes), Some(sample()));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(TelemetrySnapshot::decode(&[0u8; 10]), None);
    }

    #[test]
    fn test_debug_token_answered_with_snapshot() {
        let (server, mut client) = UnixStream::pair().unwrap();
        let mut peer = DebugPeer::new(server).unwrap();
        client.write_all(&framing::encode_record(DEBUG_TOKEN)).unwrap();

        assert_eq!(peer.poll_request().unwrap(), DebugRequest::Snapshot);
        peer.reply(&sample()).unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply.len(), 4 + SNAPSHOT_LEN);
        assert_eq!(TelemetrySnapshot::decode(&reply[4..]), Some(sample()));
    }

    #[test]
    fn test_split_request_stays_pending() {
        let (server, mut client) = UnixStream::pair().unwrap();
        let mut peer = DebugPeer::new(server).unwrap();
        assert_eq!(peer.poll_request().unwrap(), DebugRequest::Pending);

        let record = framing::encode_record(DEBUG_TOKEN);
        client.write_all(&record[..4]).unwrap();
        assert_eq!(peer.poll_request().unwrap(), DebugRequest::Pending);
        client.write_all(&record[4..]).unwrap();
        assert_eq!(peer.poll_request().unwrap(), DebugRequest::Snapshot);
    }

    #[test]
    fn test_other_payloads_ignored() {
        let (server, mut client) = UnixStream::pair().unwrap();
        let mut peer = DebugPeer::new(server).unwrap();
        client.write_all(&framing::encode_record(b"status")).unwrap();
        assert_eq!(peer.poll_request().unwrap(), DebugRequest::Ignored);
    }

    #[test]
    fn test_closed_or_oversized_peer_is_an_error() {
        let (server, client) = UnixStream::pair().unwrap();
        let mut peer = DebugPeer::new(server).unwrap();
        drop(client);
        assert!(peer.poll_request().is_err());

        let (server, mut client) = UnixStream::pair().unwrap();
        let mut peer = DebugPeer::new(server).unwrap();
        client.write_all(&framing::encode_header(1000)).unwrap();
        assert!(peer.poll_request().is_err());
    }
}
