//! Bounded envelope buffers and compaction.
//!
//! The main buffer holds wire bytes (output being assembled when enveloping,
//! unparsed input when deenveloping). Compaction is a byte-exact
//! `copy_within` of the unconsumed suffix down to offset zero; it knows how
//! many bytes were consumed, never why. The auxiliary buffer stages
//! variable-length blobs (wrapped keys, signatures) that are drained into
//! the main buffer in as many steps as free space allows.

use zeroize::Zeroize;

use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// Growable byte store with a hard capacity limit.
pub struct EnvelopeBuffer {
    data: Vec<u8>,
    limit: usize,
}

impl EnvelopeBuffer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    /// End of valid data.
    pub fn write_pos(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free space below the capacity limit.
    pub fn free_space(&self) -> usize {
        self.limit - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append as much of `bytes` as fits, returning how many were taken.
    pub fn push_slice(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.free_space());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    /// Append a complete blob or nothing. Used for structural components
    /// that must never be split.
    pub fn push_all(&mut self, bytes: &[u8]) -> EnvelopeResult<()> {
        if bytes.len() > self.free_space() {
            return Err(EnvelopeError::Overflow);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Compact: drop the first `consumed` bytes and shift the remaining
    /// `[consumed, write_pos)` range down to offset zero. Byte-exact by
    /// construction; the shifted suffix is exactly what was not consumed.
    pub fn consume(&mut self, consumed: usize) {
        debug_assert!(consumed <= self.data.len());
        if consumed == 0 {
            return;
        }
        let remaining = self.data.len() - consumed;
        self.data.copy_within(consumed.., 0);
        // The tail beyond the new write position may hold key material.
        self.data[remaining..].zeroize();
        self.data.truncate(remaining);
    }
}

impl Drop for EnvelopeBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Staging buffer with a drain cursor. Blobs are staged whole; draining
/// moves bytes into the main buffer until either side runs out.
#[derive(Default)]
pub struct AuxBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl AuxBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.data.len()
    }

    /// Stage a blob for draining.
    pub fn stage(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Move staged bytes into the main buffer. Returns true once the aux
    /// buffer is fully drained.
    pub fn drain_into(&mut self, target: &mut EnvelopeBuffer) -> bool {
        let pending = &self.data[self.cursor..];
        let moved = target.push_slice(pending);
        self.cursor += moved;
        if self.is_empty() {
            self.data.zeroize();
            self.data.clear();
            self.cursor = 0;
            true
        } else {
            false
        }
    }
}

impl Drop for AuxBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_respects_limit() {
        let mut buffer = EnvelopeBuffer::new(8);
        assert_eq!(buffer.push_slice(&[1; 5]), 5);
        assert_eq!(buffer.push_slice(&[2; 5]), 3);
        assert_eq!(buffer.free_space(), 0);
        assert!(matches!(buffer.push_all(&[3]), Err(EnvelopeError::Overflow)));
    }

    #[test]
    fn consume_shifts_suffix_exactly() {
        // Shadow logical-offset counter: after any sequence of pushes and
        // consumes, the buffer must hold exactly the unconsumed suffix of
        // everything ever pushed.
        let mut buffer = EnvelopeBuffer::new(64);
        let mut pushed: Vec<u8> = Vec::new();
        let mut logical_offset = 0usize;

        for (chunk, consume) in [(&[1u8, 2, 3, 4][..], 2), (&[5, 6, 7][..], 3), (&[8][..], 3)] {
            buffer.push_slice(chunk);
            pushed.extend_from_slice(chunk);
            buffer.consume(consume);
            logical_offset += consume;
            assert_eq!(buffer.as_slice(), &pushed[logical_offset..]);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn consume_zero_is_a_noop() {
        let mut buffer = EnvelopeBuffer::new(16);
        buffer.push_slice(&[9, 9, 9]);
        buffer.consume(0);
        assert_eq!(buffer.as_slice(), &[9, 9, 9]);
    }

    #[test]
    fn aux_drains_across_multiple_steps() {
        let mut aux = AuxBuffer::new();
        let mut target = EnvelopeBuffer::new(4);
        aux.stage(&[1, 2, 3, 4, 5, 6]);

        assert!(!aux.drain_into(&mut target));
        assert_eq!(target.as_slice(), &[1, 2, 3, 4]);

        // Caller pops two bytes, freeing space for the rest.
        target.consume(2);
        assert!(aux.drain_into(&mut target));
        assert_eq!(target.as_slice(), &[3, 4, 5, 6]);
        assert!(aux.is_empty());
    }
}
