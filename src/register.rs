//! A flat, packed bit buffer covering one whole chain register.
//!
//! Bits are addressed by chain offset: the device at position 0 (closest to TDI) owns the lowest
//! indices, and within a device bit 0 is the cell closest to its TDO pin.  The serial stream that
//! actually crosses TDI/TDO visits the devices in the opposite order, see
//! [`Chain::to_stream`](crate::chain::Chain::to_stream).
use alloc::vec;
use alloc::vec::Vec;

#[derive(Clone, PartialEq, Eq, Default)]
pub struct RegisterImage {
    bytes: Vec<u8>,
    len: usize,
}

impl RegisterImage {
    /// An image of `len` bits, all cleared.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn from_bits(bits: &[bool]) -> Self {
        let mut image = Self::new(bits.len());
        for (i, bit) in bits.iter().enumerate() {
            image.set(i, *bit);
        }
        image
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Panics if `index` is outside the register.
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {} of {}-bit register", index, self.len);
        self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    /// Panics if `index` is outside the register.
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "bit {} of {}-bit register", index, self.len);
        if value {
            self.bytes[index / 8] |= 1 << (index % 8);
        } else {
            self.bytes[index / 8] &= !(1 << (index % 8));
        }
    }

    pub fn fill(&mut self, value: bool) {
        for i in 0..self.len {
            self.set(i, value);
        }
    }

    /// Write the low `width` bits of `value` starting at `offset`, LSB first.
    pub fn set_word(&mut self, offset: usize, width: usize, value: u64) {
        for i in 0..width {
            self.set(offset + i, (value >> i) & 1 != 0);
        }
    }

    /// Read `width` (at most 64) bits starting at `offset`, LSB first.
    pub fn word(&self, offset: usize, width: usize) -> u64 {
        (0..width).fold(0, |acc, i| acc | ((self.get(offset + i) as u64) << i))
    }

    pub fn slice(&self, offset: usize, width: usize) -> Vec<bool> {
        (offset..offset + width).map(|i| self.get(i)).collect()
    }

    pub fn to_bits(&self) -> Vec<bool> {
        self.slice(0, self.len)
    }

    /// The packed bytes, LSB of byte 0 first.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl core::fmt::Debug for RegisterImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RegisterImage[{}; ", self.len)?;
        for i in (0..self.len).rev() {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        f.write_str("]")
    }
}
