//! Bit-addressed buffer primitives
//!
//! Big-endian helpers over plain byte buffers: bit 0 is the most significant
//! bit of byte 0. Every range is bounds-checked against the buffer, so none of
//! these functions reads or writes past the last byte.
//!
//! `copy_bits` ORs into its destination and never clears it first. Callers
//! hand it a zeroed (or explicitly cleared) range.

use std::borrow::Cow;

use bitvec::prelude::*;

use crate::error::{Result, SchcError};

fn range(buf: &[u8], pos: usize, len: usize) -> Result<&BitSlice<u8, Msb0>> {
    let bits = buf.view_bits::<Msb0>();
    let end = pos.checked_add(len).unwrap_or(usize::MAX);
    if end > bits.len() {
        return Err(SchcError::OutOfBounds {
            start: pos,
            end,
            len: bits.len(),
        });
    }
    Ok(&bits[pos..end])
}

fn range_mut(buf: &mut [u8], pos: usize, len: usize) -> Result<&mut BitSlice<u8, Msb0>> {
    let bits = buf.view_bits_mut::<Msb0>();
    let end = pos.checked_add(len).unwrap_or(usize::MAX);
    if end > bits.len() {
        return Err(SchcError::OutOfBounds {
            start: pos,
            end,
            len: bits.len(),
        });
    }
    Ok(&mut bits[pos..end])
}

/// Set `len` bits starting at bit `pos` to 1.
pub fn set_bits(buf: &mut [u8], pos: usize, len: usize) -> Result<()> {
    range_mut(buf, pos, len)?.fill(true);
    Ok(())
}

/// Clear `len` bits starting at bit `pos`.
pub fn clear_bits(buf: &mut [u8], pos: usize, len: usize) -> Result<()> {
    range_mut(buf, pos, len)?.fill(false);
    Ok(())
}

/// Read up to 32 bits as an unsigned integer (MSB first).
pub fn get_bits(buf: &[u8], pos: usize, len: usize) -> Result<u32> {
    if len > 32 {
        return Err(SchcError::WordTooWide(len));
    }
    let bits = range(buf, pos, len)?;
    if bits.is_empty() {
        return Ok(0);
    }
    Ok(bits.load_be::<u32>())
}

/// OR `len` source bits into the destination range.
pub fn copy_bits(
    dst: &mut [u8],
    dst_pos: usize,
    src: &[u8],
    src_pos: usize,
    len: usize,
) -> Result<()> {
    let from = range(src, src_pos, len)?;
    let to = range_mut(dst, dst_pos, len)?;
    for (i, bit) in from.iter().by_vals().enumerate() {
        if bit {
            to.set(i, true);
        }
    }
    Ok(())
}

/// Compare two bit ranges that may start at different offsets.
///
/// Both ranges are copied into zeroed scratch buffers aligned to bit 0 and
/// then compared byte by byte.
pub fn compare_bits_aligned(
    a: &[u8],
    a_pos: usize,
    b: &[u8],
    b_pos: usize,
    len: usize,
) -> Result<bool> {
    let byte_len = len.div_ceil(8);
    let mut left = vec![0u8; byte_len];
    let mut right = vec![0u8; byte_len];
    copy_bits(&mut left, 0, a, a_pos, len)?;
    copy_bits(&mut right, 0, b, b_pos, len)?;
    Ok(left == right)
}

/// Shift the `len`-bit range at `pos` towards bit 0 by `by` bits, filling with zeros.
pub fn shift_bits_left(buf: &mut [u8], pos: usize, len: usize, by: usize) -> Result<()> {
    let bits = range_mut(buf, pos, len)?;
    if by >= len {
        bits.fill(false);
    } else {
        bits.shift_start(by);
    }
    Ok(())
}

/// Shift the `len`-bit range at `pos` away from bit 0 by `by` bits, filling with zeros.
pub fn shift_bits_right(buf: &mut [u8], pos: usize, len: usize, by: usize) -> Result<()> {
    let bits = range_mut(buf, pos, len)?;
    if by >= len {
        bits.fill(false);
    } else {
        bits.shift_end(by);
    }
    Ok(())
}

/// Write `a XOR b` into the destination range, overwriting it.
pub fn xor_bits(dst: &mut [u8], dst_pos: usize, a: &BitArray<'_>, b: &BitArray<'_>) -> Result<()> {
    combine(dst, dst_pos, a, b, |x, y| x ^ y)
}

/// Write `a AND b` into the destination range, overwriting it.
pub fn and_bits(dst: &mut [u8], dst_pos: usize, a: &BitArray<'_>, b: &BitArray<'_>) -> Result<()> {
    combine(dst, dst_pos, a, b, |x, y| x & y)
}

fn combine(
    dst: &mut [u8],
    dst_pos: usize,
    a: &BitArray<'_>,
    b: &BitArray<'_>,
    op: impl Fn(bool, bool) -> bool,
) -> Result<()> {
    if a.len() != b.len() {
        return Err(SchcError::LengthMismatch(a.len(), b.len()));
    }
    let to = range_mut(dst, dst_pos, a.len())?;
    for (i, (x, y)) in a
        .bits()
        .iter()
        .by_vals()
        .zip(b.bits().iter().by_vals())
        .enumerate()
    {
        to.set(i, op(x, y));
    }
    Ok(())
}

// =============================================================================
// BitArray
// =============================================================================

/// A bit range over a borrowed or owned byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitArray<'a> {
    data: Cow<'a, [u8]>,
    offset: usize,
    len: usize,
}

impl<'a> BitArray<'a> {
    /// View `len` bits of `data` starting at bit `offset`.
    pub fn new(data: &'a [u8], offset: usize, len: usize) -> Result<Self> {
        range(data, offset, len)?;
        Ok(Self {
            data: Cow::Borrowed(data),
            offset,
            len,
        })
    }

    /// View every bit of `data`.
    pub fn from_bytes(data: &'a [u8]) -> Self {
        Self {
            data: Cow::Borrowed(data),
            offset: 0,
            len: data.len() * 8,
        }
    }

    /// An owned array of `len` zero bits.
    pub fn zeroed(len: usize) -> BitArray<'static> {
        BitArray {
            data: Cow::Owned(vec![0u8; len.div_ceil(8)]),
            offset: 0,
            len,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes the range touches.
    pub fn byte_len(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        (self.offset + self.len).div_ceil(8) - self.offset / 8
    }

    /// Bits needed after the range to reach the next byte boundary.
    pub fn padding(&self) -> usize {
        (8 - (self.offset + self.len) % 8) % 8
    }

    /// The underlying bytes, including bits outside the range.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bits(&self) -> &BitSlice<u8, Msb0> {
        &self.data.view_bits::<Msb0>()[self.offset..self.offset + self.len]
    }

    /// Read up to 32 bits at `pos`, relative to the start of the range.
    pub fn get(&self, pos: usize, len: usize) -> Result<u32> {
        if pos + len > self.len {
            return Err(SchcError::OutOfBounds {
                start: pos,
                end: pos + len,
                len: self.len,
            });
        }
        get_bits(&self.data, self.offset + pos, len)
    }

    /// Copy the range into fresh bytes starting at bit 0, zero padded.
    pub fn to_aligned(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len.div_ceil(8)];
        out.view_bits_mut::<Msb0>()[..self.len].copy_from_bitslice(self.bits());
        out
    }

    pub fn into_owned(self) -> BitArray<'static> {
        BitArray {
            data: Cow::Owned(self.data.into_owned()),
            offset: self.offset,
            len: self.len,
        }
    }
}
