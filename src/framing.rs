//! Wire codec for the relayed protocol.
//!
//! Every connection carries length-prefixed records:
//!
//! ```text
//! [u32 BE length] [payload: length bytes]
//! ```
//!
//! There is no type byte, magic number or version field. Payloads are
//! capped under 64 KiB, so the top two header bytes are always zero.
//!
//! Decoding works on a bounded [`StreamCursor`] owned by one connection
//! end. Records are returned as views into the cursor's buffer; the buffer
//! is compacted only when it is exhausted and another read is needed.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use crate::error::{is_transient, RelayError, Result};

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

/// Largest payload the header can describe (top two bytes are zero).
pub const MAX_PAYLOAD: usize = 0xFFFF;

/// How long a blocked writer waits for `POLLOUT` before re-checking.
const WRITE_WAIT_MS: libc::c_int = 1000;

/// Outcome of [`StreamCursor::fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// `n` new bytes were appended to the buffer.
    Data(usize),
    /// The descriptor has nothing more to read right now.
    Drained,
}

/// Incremental record decoder over one connection's byte stream.
///
/// Holds `[consumed | unconsumed | free]` regions of a fixed buffer sized
/// for one maximum record plus its header.
#[derive(Debug)]
pub struct StreamCursor {
    buf: Vec<u8>,
    max_record: usize,
    /// Start of the unconsumed region.
    start: usize,
    /// End of the filled region.
    end: usize,
}

impl StreamCursor {
    /// Create a cursor able to hold one record of up to `max_record` payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if `max_record` exceeds [`MAX_PAYLOAD`].
    pub fn new(max_record: usize) -> Result<Self> {
        if max_record > MAX_PAYLOAD {
            return Err(RelayError::Config(format!(
                "max_record_size {max_record} exceeds {MAX_PAYLOAD}"
            )));
        }
        Ok(Self {
            buf: vec![0u8; HEADER_LEN + max_record],
            max_record,
            start: 0,
            end: 0,
        })
    }

    /// Bytes received but not yet returned as records.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Decode the next complete record from buffered bytes.
    ///
    /// Returns `None` ("incomplete") when fewer than 4 bytes are buffered or
    /// the declared length runs past the filled region. The buffer is left
    /// untouched in that case.
    pub fn next_record(&mut self) -> Option<&[u8]> {
        let avail = self.end - self.start;
        if avail < HEADER_LEN {
            return None;
        }
        let len = declared_len(&self.buf[self.start..self.start + HEADER_LEN]);
        if avail - HEADER_LEN < len {
            return None;
        }
        let payload_start = self.start + HEADER_LEN;
        self.start = payload_start + len;
        Some(&self.buf[payload_start..payload_start + len])
    }

    /// Read more bytes from `src` into the free space.
    ///
    /// Compacts first if earlier records were consumed. `EINTR` is retried.
    ///
    /// # Errors
    ///
    /// - [`RelayError::PeerClosed`] on a zero-byte read.
    /// - [`RelayError::RecordTooLarge`] if the buffer is full and still holds
    ///   no complete record, or a header declares more than `max_record`.
    /// - [`RelayError::Io`] for any other read failure.
    pub fn fill<R: Read>(&mut self, src: &mut R) -> Result<Fill> {
        self.check_declared()?;
        self.compact();
        if self.end == self.buf.len() {
            let declared = declared_len(&self.buf[..HEADER_LEN]);
            return Err(RelayError::RecordTooLarge {
                declared,
                max: self.max_record,
            });
        }

        loop {
            match src.read(&mut self.buf[self.end..]) {
                Ok(0) => return Err(RelayError::PeerClosed),
                Ok(n) => {
                    self.end += n;
                    return Ok(Fill::Data(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Drained),
                Err(e) => return Err(RelayError::Io(e)),
            }
        }
    }

    /// Move the unconsumed tail to the front of the buffer.
    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    fn check_declared(&self) -> Result<()> {
        if self.end - self.start < HEADER_LEN {
            return Ok(());
        }
        let declared = declared_len(&self.buf[self.start..self.start + HEADER_LEN]);
        if declared > self.max_record {
            return Err(RelayError::RecordTooLarge {
                declared,
                max: self.max_record,
            });
        }
        Ok(())
    }
}

fn declared_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize
}

/// Encode the 4-byte big-endian length header for a payload of `len` bytes.
#[must_use]
pub fn encode_header(len: usize) -> [u8; HEADER_LEN] {
    debug_assert!(len <= MAX_PAYLOAD);
    (len as u32).to_be_bytes()
}

/// Encode a full record (header + payload) into one buffer.
#[must_use]
pub fn encode_record(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&encode_header(payload.len()));
    buf.extend_from_slice(payload);
    buf
}

/// Write one record as two writes: header, then payload.
///
/// Short writes, `EINTR` and `EAGAIN` are retried; on `EAGAIN` the writer
/// waits for the descriptor to become writable.
///
/// # Errors
///
/// Returns [`RelayError::RecordTooLarge`] for payloads over [`MAX_PAYLOAD`]
/// and [`RelayError::Io`] if the peer is gone.
pub fn write_record<W: Write + AsRawFd>(dst: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(RelayError::RecordTooLarge {
            declared: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    write_fully(dst, &encode_header(payload.len()))?;
    write_fully(dst, payload)
}

fn write_fully<W: Write + AsRawFd>(dst: &mut W, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        match dst.write(bytes) {
            Ok(0) => {
                return Err(RelayError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer accepted zero bytes",
                )))
            }
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(dst.as_raw_fd())?,
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(RelayError::Io(e)),
        }
    }
    Ok(())
}

/// Block until `fd` reports `POLLOUT` (or an error condition).
fn wait_writable(fd: libc::c_int) -> Result<()> {
    loop {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: `pollfd` is a valid, initialised struct and nfds is 1.
        let ready = unsafe { libc::poll(&mut pollfd, 1, WRITE_WAIT_MS) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(RelayError::Io(err));
        }
        if ready > 0 {
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return Err(RelayError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    /// Reader that hands out at most `chunk` bytes per call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn drain_all(cursor: &mut StreamCursor, src: &mut impl Read) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            while let Some(rec) = cursor.next_record() {
                out.push(rec.to_vec());
            }
            match cursor.fill(src).unwrap() {
                Fill::Data(_) => {}
                Fill::Drained => return out,
            }
        }
    }

    #[test]
    fn test_round_trip_over_socket() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let max = 1024;
        let payloads: Vec<Vec<u8>> = [0usize, 1, 8, 255, max]
            .iter()
            .map(|&len| (0..len).map(|i| (i % 251) as u8).collect())
            .collect();
        for p in &payloads {
            write_record(&mut a, p).unwrap();
        }

        let mut cursor = StreamCursor::new(max).unwrap();
        let mut got = Vec::new();
        while got.len() < payloads.len() {
            got.extend(drain_all(&mut cursor, &mut b));
        }
        assert_eq!(got, payloads);
    }

    #[test]
    fn test_zero_length_record() {
        let mut src = Trickle { data: vec![0, 0, 0, 0], pos: 0, chunk: 64 };
        let mut cursor = StreamCursor::new(16).unwrap();
        let records = drain_all(&mut cursor, &mut src);
        assert_eq!(records, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_short_header_is_incomplete_and_untouched() {
        let mut src = Trickle { data: vec![0, 0, 0], pos: 0, chunk: 64 };
        let mut cursor = StreamCursor::new(16).unwrap();
        assert_eq!(cursor.fill(&mut src).unwrap(), Fill::Data(3));
        assert!(cursor.next_record().is_none());
        assert_eq!(cursor.buffered(), &[0, 0, 0]);
    }

    #[test]
    fn test_byte_at_a_time_reassembly() {
        let mut data = encode_record(b"hello");
        data.extend_from_slice(&encode_record(b"world!"));
        let mut src = Trickle { data, pos: 0, chunk: 1 };
        let mut cursor = StreamCursor::new(16).unwrap();
        let records = drain_all(&mut cursor, &mut src);
        assert_eq!(records, vec![b"hello".to_vec(), b"world!".to_vec()]);
    }

    #[test]
    fn test_compaction_reuses_buffer() {
        // Buffer holds exactly one 8-byte record; many records must still flow.
        let mut data = Vec::new();
        for i in 0u8..20 {
            data.extend_from_slice(&encode_record(&[i; 8]));
        }
        let mut src = Trickle { data, pos: 0, chunk: 5 };
        let mut cursor = StreamCursor::new(8).unwrap();
        let records = drain_all(&mut cursor, &mut src);
        assert_eq!(records.len(), 20);
        assert_eq!(records[19], vec![19u8; 8]);
    }

    #[test]
    fn test_eof_is_peer_closed() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        let mut cursor = StreamCursor::new(16).unwrap();
        assert!(matches!(cursor.fill(&mut b), Err(RelayError::PeerClosed)));
    }

    #[test]
    fn test_oversized_declaration_is_fatal() {
        let mut data = (100u32).to_be_bytes().to_vec();
        data.extend_from_slice(&[0u8; 12]);
        let mut src = Trickle { data, pos: 0, chunk: 64 };
        let mut cursor = StreamCursor::new(16).unwrap();
        cursor.fill(&mut src).unwrap();
        assert!(cursor.next_record().is_none());
        let err = cursor.fill(&mut src).unwrap_err();
        assert!(matches!(err, RelayError::RecordTooLarge { declared: 100, max: 16 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_max_record_above_header_range_rejected() {
        assert!(matches!(
            StreamCursor::new(MAX_PAYLOAD + 1),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_header_top_bytes_zero() {
        let header = encode_header(0x1234);
        assert_eq!(header, [0, 0, 0x12, 0x34]);
        assert_eq!(encode_record(b"ab"), vec![0, 0, 0, 2, b'a', b'b']);
    }
}
