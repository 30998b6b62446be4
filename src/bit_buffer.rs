//! Residue cursor
//!
//! Position-tracked bit-level read/write buffer over `bitvec`. The compressor
//! appends residues to it and the decompressor consumes them through a cursor
//! that never runs past the end of the compressed data.

use bitvec::prelude::*;

use crate::error::{Result, SchcError};

/// A position-tracked bit-level read/write buffer.
#[derive(Debug)]
pub struct BitBuffer {
    bits: BitVec<u8, Msb0>,
    position: usize,
}

impl BitBuffer {
    /// Create a new empty BitBuffer.
    pub fn new() -> Self {
        Self {
            bits: BitVec::new(),
            position: 0,
        }
    }

    /// Create a BitBuffer reading from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: BitVec::from_slice(bytes),
            position: 0,
        }
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.position + n > self.bits.len() {
            return Err(SchcError::CursorOverrun {
                needed: n,
                position: self.position,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Read n bits (at most 64) as an integer, MSB first.
    pub fn read_bits(&mut self, n: usize) -> Result<u64> {
        if n > 64 {
            return Err(SchcError::Decompression(format!(
                "cannot read {n} bits into a 64-bit word"
            )));
        }
        self.ensure(n)?;
        let value = if n == 0 {
            0
        } else {
            self.bits[self.position..self.position + n].load_be::<u64>()
        };
        self.position += n;
        Ok(value)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Read n bits into right-aligned bytes (`ceil(n/8)` of them).
    pub fn read_bits_as_bytes(&mut self, n_bits: usize) -> Result<Vec<u8>> {
        self.ensure(n_bits)?;
        let byte_len = n_bits.div_ceil(8);
        let mut bytes = vec![0u8; byte_len];
        let pad = byte_len * 8 - n_bits;
        bytes.view_bits_mut::<Msb0>()[pad..]
            .copy_from_bitslice(&self.bits[self.position..self.position + n_bits]);
        self.position += n_bits;
        Ok(bytes)
    }

    /// Read `n` whole bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.read_bits_as_bytes(n * 8)
    }

    /// Append n bits of a value (MSB first).
    pub fn write_bits(&mut self, value: u64, n: usize) {
        for i in (0..n).rev() {
            self.bits.push(((value >> i) & 1) == 1);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_all_bytes(&[value]);
    }

    /// Append the last `n_bits` bits of a right-aligned byte string.
    pub fn write_bytes(&mut self, bytes: &[u8], n_bits: usize) {
        let slice = BitSlice::<_, Msb0>::from_slice(bytes);
        let take = n_bits.min(slice.len());
        self.bits.extend_from_bitslice(&slice[slice.len() - take..]);
    }

    /// Append a full byte slice (all bits).
    pub fn write_all_bytes(&mut self, bytes: &[u8]) {
        self.bits
            .extend_from_bitslice(BitSlice::<_, Msb0>::from_slice(bytes));
    }

    /// Zero-fill up to the next byte boundary.
    pub fn pad_to_byte(&mut self) {
        let pad = (8 - self.bits.len() % 8) % 8;
        for _ in 0..pad {
            self.bits.push(false);
        }
    }

    /// Move the read position up to the next byte boundary.
    pub fn skip_to_byte(&mut self) -> Result<()> {
        let skip = (8 - self.position % 8) % 8;
        self.ensure(skip)?;
        self.position += skip;
        Ok(())
    }

    /// Current read position in bits.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Current read position in whole bytes (rounded up).
    pub fn byte_position(&self) -> usize {
        self.position.div_ceil(8)
    }

    pub fn set_position(&mut self, pos: usize) {
        self.position = pos;
    }

    /// Remaining bits from current position.
    pub fn remaining(&self) -> usize {
        self.bits.len().saturating_sub(self.position)
    }

    /// Total number of bits in the buffer.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Byte length of the written content, including padding of the last byte.
    pub fn byte_len(&self) -> usize {
        self.bits.len().div_ceil(8)
    }

    /// Convert to a byte vector (consuming the buffer).
    pub fn into_vec(self) -> Vec<u8> {
        self.bits.into_vec()
    }
}

impl Default for BitBuffer {
    fn default() -> Self {
        Self::new()
    }
}
