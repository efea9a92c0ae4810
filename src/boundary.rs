//! Pin-level control of a discovered chain through the boundary registers.
//!
//! `BoundaryScan` keeps two composite images: the bits to shift out on the next `flush` and the
//! bits captured by the last one.  `set_pin`, `set_hiz` and `read_pin` only touch memory, so any
//! number of them cost a single commit when `flush` runs: one IR scan loading EXTEST, one DR scan
//! whose Update-DR puts the image on the pins, and one DR scan capturing what the pins settled to.
//! Capture-DR comes before Update-DR within a scan, so the scan that writes the image can only
//! see the pins as they were before it.
//!
//! # Example
//! ```
//! use jtag_bscan::boundary::BoundaryScan;
//! use jtag_bscan::cable::sim::{SimCable, SimDevice};
//! use jtag_bscan::chain::Chain;
//! use jtag_bscan::descriptor::DeviceDescriptor;
//! use jtag_bscan::statemachine::JtagSM;
//! use std::sync::Arc;
//!
//! let desc = DeviceDescriptor::builder("mcu", 0x0BA00477, 0x0FFF_FFFF)
//!     .ir_len(4)
//!     .instruction("EXTEST", 0x0)
//!     .instruction("SAMPLE/PRELOAD", 0x2)
//!     .bidir("PA0")
//!     .build()
//!     .unwrap();
//! let mut sim = SimCable::new().with_device(SimDevice::from_descriptor(&desc, 0x0BA00477));
//! let chain = Chain::from_descriptors(vec![Arc::new(desc)]);
//! let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), chain);
//! bscan.set_pin(0, "PA0", true).unwrap();
//! bscan.flush().unwrap();
//! assert!(bscan.read_pin(0, "PA0").unwrap());
//! ```
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use tracing::{debug, error, warn};

use crate::cable::Cable;
use crate::chain::{self, Chain, DiscoveryConfig};
use crate::descriptor::{ControlRef, DescriptorRepository, DeviceDescriptor};
use crate::error::{Error, PinError, ProtocolError};
use crate::netlist::PinRef;
use crate::register::RegisterImage;
use crate::statemachine::{JtagSM, Register};

/// What a pin is doing, as far as the outgoing image says.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PinState {
    DriveHigh,
    DriveLow,
    HighZ,
    /// Observe-only pin.
    Capture,
}

/// Boundary cells serving one port, as bit indices local to the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PinCells {
    pub output: Option<usize>,
    pub control: Option<ControlRef>,
    pub input: Option<usize>,
}

fn index_pins(desc: &DeviceDescriptor) -> BTreeMap<String, PinCells> {
    let mut pins: BTreeMap<String, PinCells> = desc
        .ports()
        .iter()
        .map(|p| (p.name.clone(), PinCells::default()))
        .collect();
    for cell in desc.cells() {
        let Some(port) = &cell.port else { continue };
        let entry = pins.entry(port.clone()).or_default();
        if cell.function.drives() && entry.output.is_none() {
            entry.output = Some(cell.bit);
            entry.control = cell.control;
        }
        if cell.function.observes() && entry.input.is_none() {
            entry.input = Some(cell.bit);
        }
    }
    pins
}

pub struct BoundaryScan<T> {
    jtag: JtagSM<T>,
    chain: Chain,
    pins: Vec<BTreeMap<String, PinCells>>,
    image: RegisterImage,
    captured: RegisterImage,
    dirty: bool,
    preloaded: bool,
}

impl<T, U> BoundaryScan<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// Take over `jtag` for the devices in `chain`.  No hardware is touched until `flush`.
    pub fn new(jtag: JtagSM<T>, chain: Chain) -> Self {
        let mut bscan = Self {
            jtag,
            chain,
            pins: Vec::new(),
            image: RegisterImage::default(),
            captured: RegisterImage::default(),
            dirty: false,
            preloaded: false,
        };
        bscan.rebuild();
        bscan
    }

    /// Discover the chain on `jtag` and take it over.
    pub fn discover(
        mut jtag: JtagSM<T>,
        repo: &dyn DescriptorRepository,
        config: &DiscoveryConfig,
    ) -> Result<Self, Error> {
        let chain = chain::discover(&mut jtag, repo, config)?;
        Ok(Self::new(jtag, chain))
    }

    /// Discover again, replacing the chain and resetting both images.
    pub fn rediscover(&mut self, repo: &dyn DescriptorRepository, config: &DiscoveryConfig) -> Result<(), Error> {
        self.chain = chain::discover(&mut self.jtag, repo, config)?;
        self.rebuild();
        Ok(())
    }

    fn rebuild(&mut self) {
        self.pins = self
            .chain
            .devices()
            .iter()
            .map(|d| d.boundary().map(index_pins).unwrap_or_default())
            .collect();
        self.image = RegisterImage::new(self.chain.dr_len());
        self.captured = RegisterImage::new(self.chain.dr_len());
        self.release_image(true);
        self.dirty = false;
        self.preloaded = false;
    }

    // safe values everywhere (when `safe` is set), then every control cell to its disable value
    fn release_image(&mut self, safe: bool) {
        for dev in self.chain.devices() {
            let Ok(desc) = dev.boundary() else { continue };
            for cell in desc.cells() {
                if safe {
                    self.image.set(dev.dr_offset + cell.bit, cell.safe.unwrap_or(false));
                }
                if let Some(ctrl) = cell.control {
                    self.image.set(dev.dr_offset + ctrl.cell, ctrl.disable);
                }
            }
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn jtag(&mut self) -> &mut JtagSM<T> {
        &mut self.jtag
    }

    pub fn into_inner(self) -> (JtagSM<T>, Chain) {
        (self.jtag, self.chain)
    }

    /// The image the next `flush` shifts out.
    pub fn image(&self) -> &RegisterImage {
        &self.image
    }

    /// The image captured by the last `flush` or `sample`.
    pub fn captured(&self) -> &RegisterImage {
        &self.captured
    }

    /// Whether pin writes are waiting for a `flush`.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Cells and chain offset of a pin, by port name or package pin.
    pub fn pin(&self, device: usize, pin: &str) -> Result<(usize, PinCells), Error> {
        let dev = self.chain.device(device).ok_or(PinError::NoSuchDevice(device))?;
        let desc = dev.boundary()?;
        let unknown = || PinError::UnknownPin {
            device,
            pin: pin.to_string(),
        };
        let port = desc.resolve_port(pin).ok_or_else(unknown)?;
        let cells = self.pins[device].get(&port.name).copied().ok_or_else(unknown)?;
        Ok((dev.dr_offset, cells))
    }

    /// Other pins of `device` whose outputs are enabled by the same control cell as `pin`.
    pub fn control_siblings(&self, device: usize, pin: &str) -> Result<Vec<String>, Error> {
        let (_, cells) = self.pin(device, pin)?;
        let Some(ctrl) = cells.control else {
            return Ok(Vec::new());
        };
        Ok(self.pins[device]
            .iter()
            .filter(|(_, c)| c.output != cells.output && c.control.map(|c| c.cell) == Some(ctrl.cell))
            .map(|(name, _)| name.clone())
            .collect())
    }

    /// Drive `pin` to `level` on the next flush.  When its control cell is shared, the pins behind
    /// it are enabled too and drive whatever their output cells hold.
    pub fn set_pin(&mut self, device: usize, pin: &str, level: bool) -> Result<(), Error> {
        let (offset, cells) = self.pin(device, pin)?;
        let output = cells.output.ok_or_else(|| PinError::NoOutputCell {
            device,
            pin: pin.to_string(),
        })?;
        self.image.set(offset + output, level);
        if let Some(ctrl) = cells.control {
            let enable = offset + ctrl.cell;
            if self.image.get(enable) == ctrl.disable {
                let siblings = self.control_siblings(device, pin)?;
                if !siblings.is_empty() {
                    warn!(device, pin, ?siblings, "shared control cell enables other outputs");
                }
            }
            self.image.set(enable, !ctrl.disable);
        }
        self.dirty = true;
        Ok(())
    }

    /// Put `pin` in high impedance on the next flush.
    pub fn set_hiz(&mut self, device: usize, pin: &str) -> Result<(), Error> {
        let (offset, cells) = self.pin(device, pin)?;
        let ctrl = cells.control.ok_or_else(|| PinError::NoControlCell {
            device,
            pin: pin.to_string(),
        })?;
        self.image.set(offset + ctrl.cell, ctrl.disable);
        self.dirty = true;
        Ok(())
    }

    pub fn set_state(&mut self, device: usize, pin: &str, state: PinState) -> Result<(), Error> {
        match state {
            PinState::DriveHigh => self.set_pin(device, pin, true),
            PinState::DriveLow => self.set_pin(device, pin, false),
            PinState::HighZ => self.set_hiz(device, pin),
            PinState::Capture => {
                let (_, cells) = self.pin(device, pin)?;
                if cells.input.is_none() {
                    return Err(PinError::NoObserveCell {
                        device,
                        pin: pin.to_string(),
                    }.into());
                }
                match cells.control {
                    Some(_) => self.set_hiz(device, pin),
                    None if cells.output.is_some() => Err(PinError::NoControlCell {
                        device,
                        pin: pin.to_string(),
                    }.into()),
                    None => Ok(()),
                }
            }
        }
    }

    /// The state the outgoing image puts `pin` in.
    pub fn pin_state(&self, device: usize, pin: &str) -> Result<PinState, Error> {
        let (offset, cells) = self.pin(device, pin)?;
        let Some(output) = cells.output else {
            return Ok(PinState::Capture);
        };
        if let Some(ctrl) = cells.control {
            if self.image.get(offset + ctrl.cell) == ctrl.disable {
                return Ok(PinState::HighZ);
            }
        }
        Ok(if self.image.get(offset + output) {
            PinState::DriveHigh
        } else {
            PinState::DriveLow
        })
    }

    /// The level `pin` settled to after the last flush, or seen by the last `sample`.
    pub fn read_pin(&self, device: usize, pin: &str) -> Result<bool, Error> {
        let (offset, cells) = self.pin(device, pin)?;
        let input = cells.input.ok_or_else(|| PinError::NoObserveCell {
            device,
            pin: pin.to_string(),
        })?;
        Ok(self.captured.get(offset + input))
    }

    /// Disable every output driver on the next flush.
    pub fn release_all(&mut self) {
        self.release_image(false);
        self.dirty = true;
    }

    /// Every pin with an observe cell, by device then port name.
    pub fn observable_pins(&self) -> Vec<PinRef> {
        self.pins_where(|c| c.input.is_some())
    }

    /// Every pin with an output cell, by device then port name.
    pub fn drivable_pins(&self) -> Vec<PinRef> {
        self.pins_where(|c| c.output.is_some())
    }

    fn pins_where(&self, keep: impl Fn(&PinCells) -> bool) -> Vec<PinRef> {
        let mut out = Vec::new();
        for (device, pins) in self.pins.iter().enumerate() {
            for (name, cells) in pins {
                if keep(cells) {
                    out.push(PinRef::new(device, name));
                }
            }
        }
        out
    }

    /// Commit the image under EXTEST and capture every pin once it has settled.  If any scan fails
    /// the pins are released (best effort) before the error is returned.
    pub fn flush(&mut self) -> Result<(), Error> {
        match self.shift_image() {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(%e, "flush failed, releasing all pins");
                self.release_all();
                if let Err(restore) = self.shift_image() {
                    error!(%restore, "could not release pins");
                }
                Err(e)
            }
        }
    }

    /// Run `f`, then flush exactly once whether or not it succeeded.  The writes `f` made before
    /// failing are committed; its error wins over a failed flush.
    pub fn batch<R, F>(&mut self, f: F) -> Result<R, Error>
        where F: FnOnce(&mut Self) -> Result<R, Error>
    {
        let r = f(self);
        let flushed = self.flush();
        match (r, flushed) {
            (Ok(r), Ok(())) => Ok(r),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), flushed) => {
                if let Err(flush) = flushed {
                    error!(%flush, "flush after failed batch");
                }
                Err(e)
            }
        }
    }

    /// Capture every pin through SAMPLE without driving anything.  The outgoing image is
    /// preloaded into the update latches as a side effect.
    pub fn sample(&mut self) -> Result<(), Error> {
        let ir = self.instruction_image("SAMPLE", DeviceDescriptor::sample)?;
        self.load_instruction(&ir)?;
        self.captured = self.scan_image()?;
        // a combined SAMPLE/PRELOAD scan filled the update latches
        self.preloaded |= self
            .chain
            .devices()
            .iter()
            .filter_map(|d| d.boundary().ok())
            .all(|d| d.sample() == d.preload());
        Ok(())
    }

    fn shift_image(&mut self) -> Result<(), Error> {
        if !self.preloaded {
            self.preload()?;
        }
        let ir = self.instruction_image("EXTEST", DeviceDescriptor::extest)?;
        self.load_instruction(&ir)?;
        self.scan_image()?;
        self.captured = self.scan_image()?;
        self.dirty = false;
        Ok(())
    }

    // Fill the update latches before EXTEST first takes the pins over.
    fn preload(&mut self) -> Result<(), Error> {
        match self.instruction_image("SAMPLE/PRELOAD", DeviceDescriptor::preload) {
            Ok(ir) => {
                self.load_instruction(&ir)?;
                self.scan_image()?;
                debug!("boundary registers preloaded");
            }
            Err(Error::Protocol(ProtocolError::MissingInstruction { device, .. })) => {
                debug!(%device, "no SAMPLE/PRELOAD, skipping preload");
            }
            Err(e) => return Err(e),
        }
        self.preloaded = true;
        Ok(())
    }

    /// Composite IR with `select` loaded into devices in EXTEST and BYPASS everywhere else.
    /// Registers that could not be placed are filled with ones, which is BYPASS on any device.
    fn instruction_image(
        &self,
        name: &'static str,
        select: fn(&DeviceDescriptor) -> Option<u64>,
    ) -> Result<RegisterImage, Error> {
        let mut ir = RegisterImage::new(self.chain.register_len(Register::Instruction)?);
        ir.fill(true);
        for dev in self.chain.devices() {
            let (Some(offset), Some(len)) = (dev.ir_offset, dev.ir_len) else { continue };
            match (&dev.descriptor, dev.boundary()) {
                (_, Ok(desc)) => {
                    let opcode = select(desc).ok_or_else(|| ProtocolError::MissingInstruction {
                        device: desc.name().to_string(),
                        instruction: name,
                    })?;
                    ir.set_word(offset, len, opcode);
                }
                (Some(desc), Err(_)) => ir.set_word(offset, len, desc.bypass()),
                (None, Err(_)) => {}
            }
        }
        Ok(ir)
    }

    fn load_instruction(&mut self, ir: &RegisterImage) -> Result<(), Error> {
        let stream = self.chain.to_stream(Register::Instruction, ir)?;
        self.jtag.shift_register(Register::Instruction, &stream, ir.len())?;
        Ok(())
    }

    fn scan_image(&mut self) -> Result<RegisterImage, Error> {
        let stream = self.chain.to_stream(Register::Data, &self.image)?;
        let tdo = self.jtag.shift_register(Register::Data, &stream, self.chain.dr_len())?;
        debug!(bits = tdo.len(), "boundary scan");
        self.chain.from_stream(Register::Data, &tdo)
    }
}
