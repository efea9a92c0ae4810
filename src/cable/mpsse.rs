//! Implement the `Cable` trait for FTDI MPSSE engines (FT2232H and friends).
//!
//! A `shift` is split into MPSSE commands: runs of TMS=0 clocks become LSB-first data clocks
//! (TMS holds its level during those), everything else goes out as TMS clocks of up to 7 bits
//! that share one TDI level.  Every command reads TDO back.
use std::format;
use std::vec;
use std::vec::Vec;

use crate::cable::{check_vectors, Cable, CableError};

use ftdi_mpsse::ClockTMS;
use libftd2xx::{ClockBits, ClockData, FtdiMpsse, MpsseCmdBuilder, MpsseCmdExecutor};

// keep each transfer within the FTDI's buffers
const MAX_COMMAND_BYTES: usize = 4096;

pub(crate) fn io<E: core::fmt::Debug>(e: E) -> CableError {
    CableError::Io(format!("{:?}", e))
}

// How to unpack the TDO bytes one MPSSE command returns.
enum Readback {
    // whole bytes from clock_data
    Bytes(usize),
    // 1..=8 bits from clock_bits or clock_tms, shifted in from the top of one byte
    Bits(usize),
}

impl Readback {
    fn bytes(&self) -> usize {
        match self {
            Readback::Bytes(n) => *n,
            Readback::Bits(_) => 1,
        }
    }
}

pub struct Mpsse<T> {
    pub(crate) ft: T,
    // TMS level left on the wire by the last TMS clock
    tms_level: bool,
}

impl<T: FtdiMpsse + MpsseCmdExecutor> Mpsse<T>
    where <T as MpsseCmdExecutor>::Error: core::fmt::Debug
{
    pub fn new(mut ft: T, clock: u32) -> Result<Self, CableError>
    {
        ft.initialize_mpsse_default().map_err(io)?;
        ft.set_clock(clock).map_err(io)?;

        let builder = MpsseCmdBuilder::new()
            .disable_3phase_data_clocking()
            .disable_adaptive_data_clocking();
        ft.send(builder.as_slice()).map_err(io)?;

        Ok(Self {
            ft,
            tms_level: true,
        })
    }

    fn run(&mut self, builder: MpsseCmdBuilder, reads: &[Readback], tdo: &mut Vec<bool>) -> Result<(), CableError> {
        if reads.is_empty() {
            return Ok(());
        }
        let total: usize = reads.iter().map(|r| r.bytes()).sum();
        let mut buf = vec![0u8; total];
        self.ft.xfer(builder.as_slice(), &mut buf).map_err(io)?;

        let mut at = 0;
        for r in reads {
            match r {
                Readback::Bytes(n) => {
                    tdo.extend(crate::cable::unpack_bits(&buf[at..at + n], n * 8));
                }
                Readback::Bits(n) => {
                    let byte = buf[at] >> (8 - n);
                    tdo.extend((0..*n).map(|i| byte & (1 << i) != 0));
                }
            }
            at += r.bytes();
        }
        Ok(())
    }
}

impl<T: FtdiMpsse + MpsseCmdExecutor> Cable for Mpsse<T>
    where <T as MpsseCmdExecutor>::Error: core::fmt::Debug
{
    fn shift(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, CableError> {
        check_vectors(tms, tdi)?;
        let mut tdo = Vec::with_capacity(tms.len());
        let mut builder = MpsseCmdBuilder::new();
        let mut reads = Vec::new();
        let mut i = 0;

        while i < tms.len() {
            if !tms[i] && !self.tms_level {
                let mut j = i;
                while j < tms.len() && !tms[j] {
                    j += 1;
                }
                let bits = &tdi[i..j];
                let whole = bits.len() / 8;
                if whole > 0 {
                    let data = crate::cable::pack_bits(&bits[..whole * 8]);
                    builder = builder.clock_data(ClockData::LsbPosIn, &data);
                    reads.push(Readback::Bytes(whole));
                }
                let rest = &bits[whole * 8..];
                if !rest.is_empty() {
                    let data = crate::cable::pack_bits(rest)[0];
                    builder = builder.clock_bits(ClockBits::LsbPosIn, data, rest.len() as u8);
                    reads.push(Readback::Bits(rest.len()));
                }
                i = j;
            } else {
                let level = tdi[i];
                let mut j = i;
                let mut data = 0u8;
                while j < tms.len() && j - i < 7 && tdi[j] == level {
                    if tms[j] {
                        data |= 1 << (j - i);
                    }
                    j += 1;
                }
                builder = builder.clock_tms(ClockTMS::NegTMSPosTDO, data, level, (j - i) as u8);
                reads.push(Readback::Bits(j - i));
                self.tms_level = tms[j - 1];
                i = j;
            }

            let pending: usize = reads.iter().map(|r| r.bytes()).sum();
            if builder.as_slice().len() > MAX_COMMAND_BYTES || pending > MAX_COMMAND_BYTES {
                let full = core::mem::replace(&mut builder, MpsseCmdBuilder::new());
                self.run(full, &reads, &mut tdo)?;
                reads.clear();
            }
        }
        self.run(builder, &reads, &mut tdo)?;
        Ok(tdo)
    }
}
