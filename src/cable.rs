//! Implementations for different JTAG hardware adapters live here.  Hardware adapters should
//! implement the `Cable` trait.  `sim` provides a behavioural board simulator that satisfies the
//! same trait, so everything above this layer can be exercised without hardware.
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use thiserror::Error;

pub mod gpio;
pub mod sim;

#[cfg(feature = "ftdi")]
pub mod jtagkey;
#[cfg(feature = "jlink")]
pub mod jlink;
#[cfg(feature = "ftdi")]
pub mod mpsse;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CableError {
    #[error("TMS and TDI vectors differ in length ({tms} vs {tdi})")]
    VectorLength { tms: usize, tdi: usize },

    #[error("adapter returned {got} TDO bits, expected {expected}")]
    ShortRead { expected: usize, got: usize },

    #[error("adapter I/O failure: {0}")]
    Io(String),

    #[error("no adapter found: {0}")]
    NotFound(String),
}

pub trait Cable {
    /// Clock `tms.len()` TCK cycles.  On each cycle TMS and TDI take the values at the same index,
    /// and the TDO level sampled during that cycle is returned at that index.  `tms` and `tdi`
    /// must have equal length.
    fn shift(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, CableError>;

    /// Clock out a series of TMS values to change the state of the JTAG chain, holding TDI at
    /// `tdi` throughout.
    fn change_mode(&mut self, tms: &[bool], tdi: bool) -> Result<(), CableError> {
        let tdi = vec![tdi; tms.len()];
        self.shift(tms, &tdi).map(|_| ())
    }

    /// Push out anything the adapter has queued.
    fn flush(&mut self) -> Result<(), CableError> {
        Ok(())
    }
}

impl<C: Cable + ?Sized> Cable for &mut C {
    fn shift(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, CableError> {
        (**self).shift(tms, tdi)
    }

    fn flush(&mut self) -> Result<(), CableError> {
        (**self).flush()
    }
}

pub(crate) fn check_vectors(tms: &[bool], tdi: &[bool]) -> Result<(), CableError> {
    if tms.len() != tdi.len() {
        return Err(CableError::VectorLength {
            tms: tms.len(),
            tdi: tdi.len(),
        });
    }
    Ok(())
}

/// Pack bits LSB-first into bytes, the order every adapter here puts them on the wire.
pub(crate) fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut buf = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            buf[i / 8] |= 1 << (i % 8);
        }
    }
    buf
}

/// Inverse of `pack_bits`, taking the first `bits` bits of `bytes`.
pub(crate) fn unpack_bits(bytes: &[u8], bits: usize) -> Vec<bool> {
    (0..bits).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect()
}

/// Open an adapter by name.  `clock` is the TCK frequency in hertz.
#[cfg(feature = "std")]
pub fn new_from_string(
    name: &str,
    clock: u32,
) -> Result<std::boxed::Box<dyn Cable + Send>, CableError> {
    match name {
        #[cfg(feature = "ftdi")]
        "jtagkey" => Ok(std::boxed::Box::new(jtagkey::JtagKey::new(clock, true)?)),
        #[cfg(feature = "ftdi")]
        "jtagkey-b" => Ok(std::boxed::Box::new(jtagkey::JtagKey::new(clock, false)?)),
        #[cfg(feature = "jlink")]
        "jlink" => Ok(std::boxed::Box::new(jlink::JLink::new(clock)?)),
        _ => {
            let _ = clock;
            Err(CableError::NotFound(alloc::format!("unsupported cable {}", name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_is_lsb_first() {
        let bits = [true, false, false, false, false, false, false, false, false, true];
        assert_eq!(pack_bits(&bits), vec![0x01, 0x02]);
        assert_eq!(unpack_bits(&[0x01, 0x02], 10), bits.to_vec());
    }

    #[test]
    fn mismatched_vectors_are_rejected() {
        assert_eq!(
            check_vectors(&[true, false], &[true]),
            Err(CableError::VectorLength { tms: 2, tdi: 1 })
        );
    }
}
