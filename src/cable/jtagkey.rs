//! Implement the `Cable` trait for "jtagkey" compatible hardware adapters like the Bus Blaster
use std::time::Duration;
use std::vec::Vec;

use crate::cable::mpsse::{io, Mpsse};
use crate::cable::{Cable, CableError};

use libftd2xx::{Ft2232h, Ftdi, FtdiCommon, FtdiMpsse, MpsseCmdBuilder, MpsseCmdExecutor};

// Lower pins
const PIN_TCK: u8 = 1;
const PIN_TDI: u8 = 1 << 1;
//const PIN_TDO: u8 = 1 << 2;
const PIN_TMS: u8 = 1 << 3;
const PIN_N_OE: u8 = 1 << 4;
const LOWER_OUTPUT_PINS: u8 = PIN_TCK | PIN_TDI | PIN_TMS | PIN_N_OE;

// Upper pins
const PIN_N_TRST: u8 = 1;
const PIN_N_SRST: u8 = 1 << 1;
const PIN_N_TRST_OE: u8 = 1 << 2;
const PIN_N_SRST_OE: u8 = 1 << 3;
const UPPER_OUTPUT_PINS: u8 = PIN_N_TRST | PIN_N_SRST | PIN_N_TRST_OE | PIN_N_SRST_OE;

pub struct JtagKey {
    ft: Mpsse<Ft2232h>,
}

impl JtagKey {
    /// Open a JtagKey.  FT2232-based adapters like JtagKey have both an "A" interface and a "B"
    /// interface.  `primary` selects which to use. `clock` is the TCK frequency in hertz.
    pub fn new(clock: u32, primary: bool) -> Result<Self, CableError> {
        let description = if primary {
            "Dual RS232-HS A"
        } else {
            "Dual RS232-HS B"
        };
        let ft = Ftdi::with_description(description)
            .map_err(|e| CableError::NotFound(std::format!("{}: {:?}", description, e)))?;
        let ft = Ft2232h::try_from(ft).map_err(|e| CableError::NotFound(std::format!("{:?}", e)))?;
        let mut ft = Mpsse::new(ft, clock)?;
        ft.ft.set_latency_timer(Duration::from_millis(0)).map_err(io)?;
        ft.ft.set_gpio_upper(PIN_N_TRST | PIN_N_SRST, UPPER_OUTPUT_PINS).map_err(io)?;

        let builder = MpsseCmdBuilder::new()
            .set_gpio_lower(PIN_TMS, LOWER_OUTPUT_PINS);
        ft.ft.send(builder.as_slice()).map_err(io)?;

        Ok(JtagKey {
            ft,
        })
    }

    /// JtagKey adapters implement the optional SRST signal.  This puts the board in reset, which
    /// does not disturb boundary scan.
    pub fn assert_srst(&mut self) -> Result<(), CableError> {
        self.ft.ft.set_gpio_upper(PIN_N_TRST, UPPER_OUTPUT_PINS).map_err(io)
    }

    /// Take the board out of reset.
    pub fn deassert_srst(&mut self) -> Result<(), CableError> {
        self.ft.ft.set_gpio_upper(PIN_N_TRST | PIN_N_SRST, UPPER_OUTPUT_PINS).map_err(io)
    }
}

impl Cable for JtagKey {
    fn shift(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, CableError> {
        self.ft.shift(tms, tdi)
    }
}
