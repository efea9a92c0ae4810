//! A behavioural model of a board: a scan chain of boundary-scan devices plus the wires between
//! their pins.  It implements `Cable`, so the TAP engine, chain discovery, the boundary runtime
//! and the netlist scan all run against it exactly as they would against an adapter.
//!
//! Every simulated device has its own TAP controller, an instruction register that captures
//! `...01`, and IDCODE, BYPASS and boundary data registers.  Pins are only driven while a device
//! has EXTEST loaded.  A wire whose members nobody drives floats to `floating` (pulled up by
//! default); several drivers on one wire resolve wired-AND.  A level forced with `force` beats
//! any driver, like a test clip on the board.
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::cable::{check_vectors, Cable, CableError};
use crate::descriptor::{BoundaryCell, DeviceDescriptor};
use crate::statemachine::JtagState;

type PinKey = (usize, String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Bypass,
    IdCode,
    Sample,
    Extest,
}

#[derive(Clone, Debug)]
pub struct SimDevice {
    idcode: Option<u32>,
    ir_len: usize,
    ir_capture: u64,
    opcodes: BTreeMap<u64, Mode>,
    cells: Vec<BoundaryCell>,
    boundary_len: usize,
    mode: Mode,
    ir_shift: Vec<bool>,
    dr_shift: Vec<bool>,
    update: Vec<bool>,
}

impl SimDevice {
    /// A device behaving as `desc` describes, answering with `idcode`.
    pub fn from_descriptor(desc: &DeviceDescriptor, idcode: u32) -> Self {
        let mut opcodes = BTreeMap::new();
        for (name, code) in desc.instructions() {
            let mode = match name {
                "EXTEST" => Mode::Extest,
                "SAMPLE/PRELOAD" | "SAMPLE" | "PRELOAD" => Mode::Sample,
                "IDCODE" => Mode::IdCode,
                _ => Mode::Bypass,
            };
            opcodes.insert(code, mode);
        }
        let mut dev = Self {
            idcode: Some(idcode),
            ir_len: desc.ir_len(),
            ir_capture: 0b01,
            opcodes,
            cells: desc.cells().to_vec(),
            boundary_len: desc.boundary_len(),
            mode: Mode::IdCode,
            ir_shift: Vec::new(),
            dr_shift: Vec::new(),
            update: Vec::new(),
        };
        dev.update = vec![false; dev.boundary_len];
        dev
    }

    /// A device nobody has a descriptor for.  Without an IDCODE it comes out of reset in BYPASS.
    pub fn opaque(idcode: Option<u32>, ir_len: usize) -> Self {
        Self {
            idcode,
            ir_len,
            ir_capture: 0b01,
            opcodes: BTreeMap::new(),
            cells: Vec::new(),
            boundary_len: 0,
            mode: Mode::Bypass,
            ir_shift: Vec::new(),
            dr_shift: Vec::new(),
            update: Vec::new(),
        }
    }

    /// Value the instruction register captures, `...01` by default.  Bits above the first two are
    /// design specific on real parts.
    pub fn with_ir_capture(mut self, value: u64) -> Self {
        self.ir_capture = value;
        self
    }

    fn reset(&mut self) {
        self.mode = if self.idcode.is_some() {
            Mode::IdCode
        } else {
            Mode::Bypass
        };
    }

    fn clock(&mut self, pos: usize, state: JtagState, tdi: bool, levels: &BTreeMap<PinKey, bool>) -> bool {
        match state {
            JtagState::Reset => {
                self.reset();
                true
            }
            JtagState::CaptureIR => {
                self.ir_shift = (0..self.ir_len).map(|i| i < 64 && (self.ir_capture >> i) & 1 == 1).collect();
                true
            }
            JtagState::ShiftIR => shift(&mut self.ir_shift, tdi),
            JtagState::UpdateIR => {
                let code = self
                    .ir_shift
                    .iter()
                    .enumerate()
                    .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << i));
                self.mode = self.opcodes.get(&code).copied().unwrap_or(Mode::Bypass);
                true
            }
            JtagState::CaptureDR => {
                self.dr_shift = self.capture(pos, levels);
                true
            }
            JtagState::ShiftDR => shift(&mut self.dr_shift, tdi),
            JtagState::UpdateDR => {
                if matches!(self.mode, Mode::Sample | Mode::Extest) && self.dr_shift.len() == self.boundary_len {
                    self.update = self.dr_shift.clone();
                }
                true
            }
            _ => true,
        }
    }

    fn capture(&self, pos: usize, levels: &BTreeMap<PinKey, bool>) -> Vec<bool> {
        match (self.mode, self.idcode) {
            (Mode::IdCode, Some(id)) => (0..32).map(|i| (id >> i) & 1 == 1).collect(),
            (Mode::Sample, _) | (Mode::Extest, _) if self.boundary_len > 0 => {
                let mut bits = self.update.clone();
                for cell in &self.cells {
                    if cell.function.observes() {
                        if let Some(port) = &cell.port {
                            bits[cell.bit] = levels
                                .get(&(pos, port.clone()))
                                .copied()
                                .unwrap_or(true);
                        }
                    }
                }
                bits
            }
            _ => vec![false],
        }
    }

    /// Pins this device is actively driving right now, with their levels.
    fn drivers(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        let active = self.mode == Mode::Extest;
        self.cells.iter().filter_map(move |cell| {
            if !active || !cell.function.drives() {
                return None;
            }
            let enabled = match cell.control {
                Some(ctrl) => self.update[ctrl.cell] != ctrl.disable,
                None => true,
            };
            if !enabled {
                return None;
            }
            cell.port.as_deref().map(|p| (p, self.update[cell.bit]))
        })
    }

    fn ports(&self) -> impl Iterator<Item = &str> + '_ {
        self.cells.iter().filter_map(|c| c.port.as_deref())
    }
}

fn shift(reg: &mut Vec<bool>, tdi: bool) -> bool {
    if reg.is_empty() {
        return tdi;
    }
    let out = reg.remove(0);
    reg.push(tdi);
    out
}

#[derive(Clone, Debug)]
pub struct SimCable {
    devices: Vec<SimDevice>,
    wires: Vec<Vec<PinKey>>,
    forced: BTreeMap<PinKey, bool>,
    floating: bool,
    state: JtagState,
    clocks: usize,
    ir_updates: usize,
    dr_updates: usize,
}

impl Default for SimCable {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCable {
    /// An empty chain: TDO follows TDI.
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            wires: Vec::new(),
            forced: BTreeMap::new(),
            floating: true,
            state: JtagState::Reset,
            clocks: 0,
            ir_updates: 0,
            dr_updates: 0,
        }
    }

    /// Append a device at the TDO end of the chain and return its position.
    pub fn add_device(&mut self, device: SimDevice) -> usize {
        self.devices.push(device);
        self.devices.len() - 1
    }

    pub fn with_device(mut self, device: SimDevice) -> Self {
        self.add_device(device);
        self
    }

    /// Put all `pins` on one wire, merging any wires they are already on.
    pub fn connect(&mut self, pins: &[(usize, &str)]) {
        let mut merged: Vec<PinKey> = pins.iter().map(|(d, p)| (*d, p.to_string())).collect();
        self.wires.retain(|wire| {
            if wire.iter().any(|k| merged.contains(k)) {
                merged.extend(wire.iter().cloned());
                false
            } else {
                true
            }
        });
        merged.sort();
        merged.dedup();
        self.wires.push(merged);
    }

    /// Clamp a pin to a level from outside the chain, or release it with `None`.
    pub fn force(&mut self, device: usize, pin: &str, level: Option<bool>) {
        match level {
            Some(l) => {
                self.forced.insert((device, pin.to_string()), l);
            }
            None => {
                self.forced.remove(&(device, pin.to_string()));
            }
        }
    }

    /// Level a wire settles to when nothing drives it.
    pub fn set_floating(&mut self, level: bool) {
        self.floating = level;
    }

    pub fn tap_state(&self) -> JtagState {
        self.state
    }

    pub fn clocks(&self) -> usize {
        self.clocks
    }

    /// Number of times Update-IR has been passed.
    pub fn ir_updates(&self) -> usize {
        self.ir_updates
    }

    /// Number of times Update-DR has been passed.
    pub fn dr_updates(&self) -> usize {
        self.dr_updates
    }

    /// Every pin currently driven by a device in EXTEST, with its level.
    pub fn driven_pins(&self) -> Vec<(usize, String, bool)> {
        let mut out = Vec::new();
        for (pos, dev) in self.devices.iter().enumerate() {
            for (pin, level) in dev.drivers() {
                out.push((pos, pin.to_string(), level));
            }
        }
        out
    }

    /// The level every pin on the board currently settles to.
    pub fn pin_levels(&self) -> BTreeMap<PinKey, bool> {
        let mut driven: BTreeMap<PinKey, bool> = BTreeMap::new();
        for (pos, dev) in self.devices.iter().enumerate() {
            for (pin, level) in dev.drivers() {
                let e = driven.entry((pos, pin.to_string())).or_insert(true);
                *e &= level;
            }
        }

        let mut levels = BTreeMap::new();
        for (pos, dev) in self.devices.iter().enumerate() {
            for port in dev.ports() {
                let key = (pos, port.to_string());
                if levels.contains_key(&key) {
                    continue;
                }
                let group: Vec<PinKey> = self
                    .wires
                    .iter()
                    .find(|w| w.contains(&key))
                    .cloned()
                    .unwrap_or_else(|| vec![key.clone()]);
                let level = self.resolve(&group, &driven);
                for member in group {
                    levels.insert(member, level);
                }
            }
        }
        levels
    }

    fn resolve(&self, group: &[PinKey], driven: &BTreeMap<PinKey, bool>) -> bool {
        if let Some(level) = group.iter().find_map(|k| self.forced.get(k)) {
            return *level;
        }
        let mut drivers = group.iter().filter_map(|k| driven.get(k)).peekable();
        if drivers.peek().is_none() {
            return self.floating;
        }
        drivers.all(|l| *l)
    }
}

impl Cable for SimCable {
    fn shift(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, CableError> {
        check_vectors(tms, tdi)?;
        let mut tdo = Vec::with_capacity(tms.len());

        for (t, d) in tms.iter().zip(tdi) {
            let state = self.state;
            let levels = if state == JtagState::CaptureDR {
                self.pin_levels()
            } else {
                BTreeMap::new()
            };

            let shifting = matches!(state, JtagState::ShiftDR | JtagState::ShiftIR);
            let mut bit = *d;
            for (pos, dev) in self.devices.iter_mut().enumerate() {
                let out = dev.clock(pos, state, bit, &levels);
                bit = if shifting { out } else { true };
            }
            tdo.push(bit);

            match state {
                JtagState::UpdateIR => self.ir_updates += 1,
                JtagState::UpdateDR => self.dr_updates += 1,
                _ => {}
            }
            self.state = state.next(*t);
            self.clocks += 1;
        }
        Ok(tdo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::{JtagSM, Register};

    fn chip() -> DeviceDescriptor {
        DeviceDescriptor::builder("chip", 0x1234_5679, !0)
            .ir_len(3)
            .instruction("EXTEST", 0b000)
            .instruction("SAMPLE/PRELOAD", 0b010)
            .instruction("IDCODE", 0b001)
            .bidir("A")
            .input("B")
            .build()
            .unwrap()
    }

    #[test]
    fn idcode_comes_out_after_reset() {
        let mut sim = SimCable::new().with_device(SimDevice::from_descriptor(&chip(), 0x1234_5679));
        let mut sm = JtagSM::new(&mut sim);
        sm.reset().unwrap();
        let bits = sm.shift_register(Register::Data, &[true; 32], 32).unwrap();
        let id = bits.iter().enumerate().fold(0u32, |acc, (i, b)| acc | ((*b as u32) << i));
        assert_eq!(id, 0x1234_5679);
    }

    #[test]
    fn ir_capture_pattern() {
        let mut sim = SimCable::new().with_device(SimDevice::from_descriptor(&chip(), 0x1234_5679));
        let mut sm = JtagSM::new(&mut sim);
        let bits = sm.shift_register(Register::Instruction, &[true; 3], 3).unwrap();
        assert_eq!(bits, vec![true, false, false]);
        drop(sm);
        assert_eq!(sim.ir_updates(), 1);
    }

    #[test]
    fn extest_drives_and_wired_pins_follow() {
        let mut sim = SimCable::new()
            .with_device(SimDevice::from_descriptor(&chip(), 0x1234_5679))
            .with_device(SimDevice::from_descriptor(&chip(), 0x1234_5679));
        sim.connect(&[(0, "A"), (1, "B")]);
        let mut sm = JtagSM::new(&mut sim);
        // both devices in EXTEST
        sm.shift_register(Register::Instruction, &[false; 6], 6).unwrap();
        // device 0 (far end of the stream): control=1 enables, A=0; device 1 left disabled
        let stream = [false, false, false, true, false, false];
        sm.shift_register(Register::Data, &stream, 6).unwrap();
        let got = sm.shift_register(Register::Data, &stream, 6).unwrap();
        // device 1's B input is the third bit out
        assert!(!got[2]);
        drop(sm);
        assert_eq!(sim.driven_pins(), vec![(0, "A".to_string(), false)]);
    }

    #[test]
    fn forced_level_beats_float() {
        let mut sim = SimCable::new().with_device(SimDevice::from_descriptor(&chip(), 0x1234_5679));
        assert_eq!(sim.pin_levels().get(&(0, "B".to_string())), Some(&true));
        sim.force(0, "B", Some(false));
        assert_eq!(sim.pin_levels().get(&(0, "B".to_string())), Some(&false));
    }
}
