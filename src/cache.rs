//! Bounded replay buffer for records awaiting an absent peer.
//!
//! Records are stored already framed (`[u32 BE length][payload]`) in one
//! flat buffer. Unlike a ring buffer, a full cache never evicts: a record
//! that does not fit is rejected whole and the cache is left unchanged.
//!
//! # Usage in the relay
//!
//! One cache exists per relay direction and consumer. While a consumer is
//! offline the producer's read callback calls [`RecordCache::store`]; when
//! the consumer appears, [`RecordCache::replay`] writes every record to it
//! in arrival order. Replay does not consume the cache; it is cleared by
//! the consumer's disconnect.

use std::io::Write;
use std::os::unix::io::AsRawFd;

use crate::error::{RelayError, Result};
use crate::framing::{self, HEADER_LEN};

/// Default cache capacity: 64 KiB.
pub const DEFAULT_CACHE_CAPACITY: usize = 64 * 1024;

/// Append-only, fixed-capacity store of framed records.
#[derive(Debug)]
pub struct RecordCache {
    buf: Vec<u8>,
    count: usize,
    capacity: usize,
}

impl RecordCache {
    /// Create an empty cache holding at most `capacity` bytes (headers included).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(16 * 1024)),
            count: 0,
            capacity,
        }
    }

    /// Append a pre-encoded record (header + payload).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::CacheFull`] if the record would push occupancy
    /// above capacity. Nothing is written in that case.
    pub fn store(&mut self, record: &[u8]) -> Result<()> {
        let available = self.capacity - self.buf.len();
        if record.len() > available {
            return Err(RelayError::CacheFull {
                needed: record.len(),
                available,
            });
        }
        self.buf.extend_from_slice(record);
        self.count += 1;
        Ok(())
    }

    /// Frame `payload` and append it.
    pub fn store_payload(&mut self, payload: &[u8]) -> Result<()> {
        let needed = HEADER_LEN + payload.len();
        let available = self.capacity - self.buf.len();
        if needed > available {
            return Err(RelayError::CacheFull { needed, available });
        }
        self.buf.extend_from_slice(&framing::encode_header(payload.len()));
        self.buf.extend_from_slice(payload);
        self.count += 1;
        Ok(())
    }

    /// Write every cached record to `dst`, oldest first.
    ///
    /// Each record is re-parsed from its stored header and sent as header
    /// then payload. Stops at the first failed write.
    ///
    /// Returns the number of records sent.
    pub fn replay<W: Write + AsRawFd>(&self, dst: &mut W) -> Result<usize> {
        let mut sent = 0;
        for payload in self.records() {
            framing::write_record(dst, payload)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Iterate over cached payloads in insertion order.
    pub fn records(&self) -> Records<'_> {
        Records {
            buf: &self.buf,
            remaining: self.count,
        }
    }

    /// Raw framed contents (headers included).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of cached records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Occupied bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard all records.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.count = 0;
    }
}

/// Iterator over the payloads of a [`RecordCache`].
#[derive(Debug)]
pub struct Records<'a> {
    buf: &'a [u8],
    remaining: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.buf.len() < HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let end = HEADER_LEN + len;
        if self.buf.len() < end {
            return None;
        }
        let payload = &self.buf[HEADER_LEN..end];
        self.buf = &self.buf[end..];
        self.remaining -= 1;
        Some(payload)
    }
}
