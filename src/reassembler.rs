//! Newline packet reassembly for a single connection.
//!
//! Bytes arrive in arbitrary chunks. They accumulate in a growable buffer
//! until a delimiter is seen; everything up to and including the delimiter
//! is cut out as one packet and the remainder is shifted to the front.
//!
//! ## Growth
//!
//! Capacity starts at the configured initial size and doubles whenever the
//! occupied length plus the incoming chunk plus one terminator byte would
//! not fit. It never shrinks while the connection lives. If growing fails,
//! either because the allocator refuses or because the configured limit
//! would be exceeded, the accumulated bytes and the incoming chunk are
//! dropped and reassembly restarts from an empty buffer.

use crate::error::GrowthError;
use bytes::Bytes;
use tracing::{trace, warn};

/// Byte that terminates every packet.
pub const DELIMITER: u8 = b'\n';

/// Per-connection reassembly buffer.
#[derive(Debug)]
pub struct Reassembler {
    /// Bytes received but not yet cut into a packet.
    buf: Vec<u8>,
    /// Logical capacity; follows the doubling schedule.
    capacity: usize,
    /// Initial capacity, used for the first allocation.
    initial: usize,
    /// Upper bound on `capacity`.
    limit: usize,
    /// Leading bytes of `buf` already known to hold no delimiter.
    scanned: usize,
}

impl Reassembler {
    /// Create an empty reassembler. No memory is allocated until data arrives.
    pub fn new(initial_capacity: usize) -> Self {
        Self::with_limit(initial_capacity, usize::MAX)
    }

    /// Like [`Reassembler::new`], but growth past `limit` bytes fails.
    pub fn with_limit(initial_capacity: usize, limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity: 0,
            initial: initial_capacity.max(1),
            limit,
            scanned: 0,
        }
    }

    /// Append a chunk and return every packet it completes, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut packets = Vec::new();
        if self.push(chunk) {
            while let Some(packet) = self.next_packet() {
                packets.push(packet);
            }
        }
        packets
    }

    /// Append a chunk to the occupied region.
    ///
    /// Returns `false` if the buffer could not grow, in which case all
    /// pending bytes (including `chunk`) have been discarded.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if chunk.is_empty() {
            return true;
        }
        if let Err(e) = self.reserve_for(chunk.len()) {
            warn!(
                pending = self.buf.len(),
                chunk = chunk.len(),
                error = %e,
                "Buffer growth failed, discarding packet"
            );
            self.buf.clear();
            self.scanned = 0;
            return false;
        }
        self.buf.extend_from_slice(chunk);
        true
    }

    /// Cut the next complete packet from the front of the buffer.
    ///
    /// The packet includes its delimiter. Remaining bytes move to the front.
    /// Bytes searched by an earlier call are not searched again.
    pub fn next_packet(&mut self) -> Option<Bytes> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == DELIMITER) else {
            self.scanned = self.buf.len();
            return None;
        };
        let end = self.scanned + offset;
        let packet = Bytes::copy_from_slice(&self.buf[..=end]);
        self.buf.drain(..=end);
        self.scanned = 0;
        trace!(len = packet.len(), remaining = self.buf.len(), "Packet complete");
        Some(packet)
    }

    /// Bytes received but not yet part of a complete packet.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Current logical capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Make room for `additional` bytes plus a terminator, doubling as needed.
    fn reserve_for(&mut self, additional: usize) -> Result<(), GrowthError> {
        let needed = self.buf.len().saturating_add(additional).saturating_add(1);
        if needed <= self.capacity {
            return Ok(());
        }
        if needed > self.limit {
            return Err(GrowthError::Limit {
                needed,
                limit: self.limit,
            });
        }

        let mut new_capacity = if self.capacity == 0 {
            self.initial
        } else {
            self.capacity.saturating_mul(2)
        };
        while new_capacity < needed {
            new_capacity = new_capacity.saturating_mul(2);
        }
        let new_capacity = new_capacity.min(self.limit);

        self.buf.try_reserve_exact(new_capacity - self.buf.len())?;
        trace!(from = self.capacity, to = new_capacity, "Reassembly buffer grown");
        self.capacity = new_capacity;
        Ok(())
    }
}
