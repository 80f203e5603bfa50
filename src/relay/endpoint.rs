//! Per-endpoint connection state and traffic counters.

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::RecordCache;
use crate::error::RelayError;
use crate::framing::{Fill, StreamCursor, HEADER_LEN};

/// Which of the two client sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClientSlot {
    /// Extra client, only served in fission mode.
    Primary,
    /// Default client.
    Secondary,
}

impl ClientSlot {
    /// Both slots in client-index order.
    pub const ALL: [ClientSlot; 2] = [ClientSlot::Primary, ClientSlot::Secondary];

    /// Array index of this slot.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }
}

impl std::fmt::Display for ClientSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Either end of a relay pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    /// The modem control process.
    Upstream,
    /// One of the SIM client processes.
    Client(ClientSlot),
}

/// Connection status reported through telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnStatus {
    /// No socket bound or connected.
    #[default]
    Closed,
    /// Listening for a peer.
    Listening,
    /// Peer connected and relaying.
    Connected,
}

impl ConnStatus {
    /// Numeric form used in the snapshot encoding.
    #[must_use]
    pub fn code(self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::Listening => 1,
            Self::Connected => 2,
        }
    }

    /// Inverse of [`ConnStatus::code`].
    #[must_use]
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Listening,
            2 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

/// Traffic counters for one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Records received from this endpoint.
    pub packets_in: u64,
    /// Records written to this endpoint.
    pub packets_out: u64,
    /// Payload bytes received.
    pub bytes_in: u64,
    /// Payload bytes written.
    pub bytes_out: u64,
    /// Time of the last record in either direction.
    pub last_activity: Option<DateTime<Utc>>,
    /// Current connection status.
    pub status: ConnStatus,
    /// Number of times this endpoint's connection was torn down, over the
    /// process lifetime. Not cleared by a counter reset.
    pub disconnects: u64,
}

impl Counters {
    pub(crate) fn record_in(&mut self, len: usize) {
        self.packets_in += 1;
        self.bytes_in += len as u64;
        self.last_activity = Some(Utc::now());
    }

    pub(crate) fn record_out(&mut self, len: usize) {
        self.packets_out += 1;
        self.bytes_out += len as u64;
        self.last_activity = Some(Utc::now());
    }

    /// Account for `records` cached records replayed in one burst.
    pub(crate) fn record_replay(&mut self, records: usize, framed_bytes: usize) {
        if records == 0 {
            return;
        }
        self.packets_out += records as u64;
        self.bytes_out += framed_bytes.saturating_sub(records * HEADER_LEN) as u64;
        self.last_activity = Some(Utc::now());
    }

    /// Zero the traffic counters. `status` and the lifetime `disconnects`
    /// count are kept.
    pub(crate) fn reset(&mut self) {
        *self = Self {
            status: self.status,
            disconnects: self.disconnects,
            ..Self::default()
        };
    }

    /// True if no traffic has been counted since the last reset.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.packets_in == 0
            && self.packets_out == 0
            && self.bytes_in == 0
            && self.bytes_out == 0
            && self.last_activity.is_none()
    }
}

/// One side of a relay pair: listen socket, live connection, decoder.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) path: PathBuf,
    pub(crate) listener: Option<UnixListener>,
    pub(crate) stream: Option<UnixStream>,
    pub(crate) cursor: Option<StreamCursor>,
    pub(crate) accepted: bool,
    pub(crate) counters: Counters,
}

impl Endpoint {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            listener: None,
            stream: None,
            cursor: None,
            accepted: false,
            counters: Counters::default(),
        }
    }

    pub(crate) fn stream_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Adopt a freshly accepted or connected stream.
    pub(crate) fn attach(&mut self, stream: UnixStream, cursor: StreamCursor) {
        self.stream = Some(stream);
        self.cursor = Some(cursor);
        self.accepted = true;
        self.counters.status = ConnStatus::Connected;
    }

    /// Drop the live connection. Returns the closed descriptor, if any.
    ///
    /// The caller removes the reactor watch before the stream is dropped so
    /// the descriptor number cannot be reused while still registered.
    pub(crate) fn detach(&mut self) -> Option<UnixStream> {
        let stream = self.stream.take();
        self.cursor = None;
        self.accepted = false;
        if stream.is_some() {
            self.counters.disconnects += 1;
        }
        self.counters.status = if self.listener.is_some() {
            ConnStatus::Listening
        } else {
            ConnStatus::Closed
        };
        stream
    }

    /// Read until the socket is drained, collecting every complete record.
    ///
    /// Records decoded before a terminal condition are still returned; the
    /// condition (EOF, I/O error, oversized record) comes back alongside.
    pub(crate) fn read_records(&mut self) -> (Vec<Vec<u8>>, Option<RelayError>) {
        let mut records = Vec::new();
        let (Some(stream), Some(cursor)) = (self.stream.as_mut(), self.cursor.as_mut()) else {
            return (records, None);
        };
        loop {
            while let Some(payload) = cursor.next_record() {
                records.push(payload.to_vec());
            }
            match cursor.fill(stream) {
                Ok(Fill::Data(_)) => {}
                Ok(Fill::Drained) => return (records, None),
                Err(e) => return (records, Some(e)),
            }
        }
    }
}

/// A client endpoint plus the caches on both sides of it.
#[derive(Debug)]
pub(crate) struct ClientEndpoint {
    pub(crate) slot: ClientSlot,
    /// Physical SIM slot this client serves.
    pub(crate) sim_slot: u8,
    /// Served in the current mode.
    pub(crate) active: bool,
    pub(crate) endpoint: Endpoint,
    /// Upstream records waiting for this client to connect.
    pub(crate) inbound: Option<RecordCache>,
    /// This client's records waiting for upstream to connect.
    pub(crate) outbound: Option<RecordCache>,
}

impl ClientEndpoint {
    pub(crate) fn new(slot: ClientSlot, path: PathBuf, active: bool) -> Self {
        Self {
            slot,
            sim_slot: slot.index() as u8,
            active,
            endpoint: Endpoint::new(path),
            inbound: None,
            outbound: None,
        }
    }
}
