//! Length-tracked bitmaps in the on-disk extent bit order.
//!
//! Bit `i` lives in byte `i / 8` under the mask `0x80 >> (i % 8)`, so the first page of an extent
//! is the most significant bit of the first byte. Encoded form is a big-endian `u32` holding the
//! length in bits, followed by exactly as many bytes as that length needs.

use std::{fmt, io};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Size of the bit-length prefix in front of every encoded bitmap.
pub const BITMAP_PREFIX_LEN: usize = 4;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct PageBitmap {
    bits: u32,
    bytes: Vec<u8>,
}

impl fmt::Debug for PageBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBitmap")
            .field("bits", &self.bits)
            .field("set", &self.iter_set().collect::<Vec<_>>())
            .finish()
    }
}

#[inline]
fn bytes_for(bits: u32) -> usize {
    (bits as usize).div_ceil(8)
}

#[inline]
fn mask(idx: u32) -> u8 {
    0x80 >> (idx % 8)
}

impl PageBitmap {
    /// Create an all-clear bitmap holding `bits` bits.
    pub fn new(bits: u32) -> Self {
        Self {
            bits,
            bytes: vec![0; bytes_for(bits)],
        }
    }

    /// Length in bits.
    pub fn len_bits(&self) -> u32 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Check a bit. Bits past the end read as clear.
    pub fn is_set(&self, idx: u32) -> bool {
        if idx >= self.bits {
            return false;
        }
        self.bytes[(idx / 8) as usize] & mask(idx) != 0
    }

    /// Set a bit.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is past the end of the bitmap.
    pub fn set(&mut self, idx: u32) {
        assert!(idx < self.bits, "bit {idx} out of range for {} bits", self.bits);
        self.bytes[(idx / 8) as usize] |= mask(idx);
    }

    /// Clear a bit. Clearing past the end is a no-op, as the bit already reads as clear.
    pub fn clear(&mut self, idx: u32) {
        if idx < self.bits {
            self.bytes[(idx / 8) as usize] &= !mask(idx);
        }
    }

    /// Grow to `bits` bits. New bits are clear. Never shrinks.
    pub fn grow(&mut self, bits: u32) {
        if bits <= self.bits {
            return;
        }
        self.bytes.resize(bytes_for(bits), 0);
        self.bits = bits;
    }

    /// OR another bitmap into this one, growing to the longer of the two lengths.
    pub fn or_assign(&mut self, other: &PageBitmap) {
        self.grow(other.bits);
        for (dst, src) in self.bytes.iter_mut().zip(other.bytes.iter()) {
            *dst |= *src;
        }
    }

    /// Find the first set bit at or after `start`.
    pub fn first_set_from(&self, start: u32) -> Option<u32> {
        if start >= self.bits {
            return None;
        }
        let first_byte = (start / 8) as usize;
        for (i, byte) in self.bytes.iter().enumerate().skip(first_byte) {
            let mut b = *byte;
            if i == first_byte {
                // Drop the bits before `start` within its own byte
                b &= 0xFFu8 >> (start % 8);
            }
            if b != 0 {
                let idx = (i as u32) * 8 + b.leading_zeros();
                return (idx < self.bits).then_some(idx);
            }
        }
        None
    }

    /// Find the first set bit.
    pub fn first_set(&self) -> Option<u32> {
        self.first_set_from(0)
    }

    /// Count the set bits.
    pub fn count_set(&self) -> u32 {
        // Bits past `self.bits` in the last byte are never set, so whole bytes can be counted.
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// Iterate over the indices of all set bits, in order.
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        let mut next = 0;
        std::iter::from_fn(move || {
            let idx = self.first_set_from(next)?;
            next = idx + 1;
            Some(idx)
        })
    }

    /// Number of bytes [`write_to`](Self::write_to) produces.
    pub fn encoded_len(&self) -> usize {
        BITMAP_PREFIX_LEN + self.bytes.len()
    }

    pub fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.bits)?;
        w.write_all(&self.bytes)
    }

    pub fn read_from<R: io::Read>(r: &mut R) -> io::Result<Self> {
        let bits = r.read_u32::<BigEndian>()?;
        let mut bytes = vec![0; bytes_for(bits)];
        r.read_exact(&mut bytes)?;
        // Scrub trailing garbage so counts and scans never see bits past the length
        if bits % 8 != 0 {
            if let Some(last) = bytes.last_mut() {
                *last &= !(0xFFu8 >> (bits % 8));
            }
        }
        Ok(Self { bits, bytes })
    }
}
