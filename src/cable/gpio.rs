//! Bit-bang JTAG over four GPIO pins, for hosts that are themselves embedded.
use alloc::format;
use alloc::vec::Vec;
use embedded_hal::{delay::DelayNs, digital::{InputPin, OutputPin, PinState}};

use crate::cable::{check_vectors, Cable, CableError};

fn io<E: core::fmt::Debug>(e: E) -> CableError {
    CableError::Io(format!("gpio: {:?}", e))
}

pub struct Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    half_period: u32,
    delay: Delay,
    clock: Clk,
    tdi: Tdi,
    tdo: Tdo,
    tms: Tms
}

impl<Clk, Tdi, Tdo, Tms, Delay> Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    /// `freq_khz` is the TCK frequency and must be non-zero.
    pub fn new(freq_khz: u32, clock: Clk, tdi: Tdi, tdo: Tdo, tms: Tms, delay: Delay) -> Gpio<Clk, Tdi, Tdo, Tms, Delay> {
        let period_ns = 1_000_000 / freq_khz.max(1);
        let half_period = period_ns / 2;
        Gpio { half_period, clock, tdi, tdo, tms, delay }
    }
}

impl<Clk, Tdi, Tdo, Tms, Delay> Cable for Gpio<Clk, Tdi, Tdo, Tms, Delay> where Clk: OutputPin, Tdi: OutputPin, Tdo: InputPin, Tms: OutputPin, Delay: DelayNs {
    fn shift(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, CableError> {
        check_vectors(tms, tdi)?;
        let mut tdo = Vec::with_capacity(tms.len());

        // clock starts low
        for (t, d) in tms.iter().zip(tdi) {
            self.tms.set_state(PinState::from(*t)).map_err(io)?;
            self.tdi.set_state(PinState::from(*d)).map_err(io)?;
            self.clock.set_high().map_err(io)?;

            // Sample the tdo line
            tdo.push(self.tdo.is_high().map_err(io)?);

            // Finish the clock period
            self.delay.delay_ns(self.half_period);
            self.clock.set_low().map_err(io)?;
            self.delay.delay_ns(self.half_period);
        }
        Ok(tdo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::Cell;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;

    struct Out(Rc<Cell<bool>>, Rc<Cell<usize>>);
    struct Loopback(Rc<Cell<bool>>);
    struct NoDelay;

    impl ErrorType for Out {
        type Error = Infallible;
    }

    impl OutputPin for Out {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            if !self.0.get() {
                self.1.set(self.1.get() + 1);
            }
            self.0.set(true);
            Ok(())
        }
    }

    impl ErrorType for Loopback {
        type Error = Infallible;
    }

    impl InputPin for Loopback {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.0.get())
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.0.get())
        }
    }

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn tdo_follows_tdi_through_a_wire() {
        let edges = Rc::new(Cell::new(0));
        let tdi = Rc::new(Cell::new(false));
        let mut gpio = Gpio::new(
            1000,
            Out(Rc::new(Cell::new(false)), edges.clone()),
            Out(tdi.clone(), Rc::new(Cell::new(0))),
            Loopback(tdi),
            Out(Rc::new(Cell::new(false)), Rc::new(Cell::new(0))),
            NoDelay,
        );
        let bits = [true, false, true, true];
        assert_eq!(gpio.shift(&[false; 4], &bits).unwrap(), bits.to_vec());
        assert_eq!(edges.get(), 4);
        assert_eq!(gpio.shift(&[true], &[]), Err(CableError::VectorLength { tms: 1, tdi: 0 }));
        assert_eq!(gpio.shift(&[], &[]), Ok(vec![]));
    }
}
