//! This provides a higher-level interface than the `Cable` trait.  Specifically, it keeps track of
//! the state of the JTAG state machine, and allows setting the state to any desired state.
//! `JtagSM` will get to that state by the most efficient path, based on the current state.
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use tracing::{debug, trace};

use crate::cable::Cable;
use crate::error::{Error, ProtocolError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Register {
    Data,
    Instruction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JtagState {
    Reset = 0,
    Idle = 1,
    SelectDR = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIR = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

use JtagState::*;

// Indexed by state, then by TMS.
const TRANSITIONS: [[JtagState; 2]; 16] = [
    [Idle, Reset],          // Reset
    [Idle, SelectDR],       // Idle
    [CaptureDR, SelectIR],  // SelectDR
    [ShiftDR, Exit1DR],     // CaptureDR
    [ShiftDR, Exit1DR],     // ShiftDR
    [PauseDR, UpdateDR],    // Exit1DR
    [PauseDR, Exit2DR],     // PauseDR
    [ShiftDR, UpdateDR],    // Exit2DR
    [Idle, SelectDR],       // UpdateDR
    [CaptureIR, Reset],     // SelectIR
    [ShiftIR, Exit1IR],     // CaptureIR
    [ShiftIR, Exit1IR],     // ShiftIR
    [PauseIR, UpdateIR],    // Exit1IR
    [PauseIR, Exit2IR],     // PauseIR
    [ShiftIR, UpdateIR],    // Exit2IR
    [Idle, SelectDR],       // UpdateIR
];

/// Number of TMS=1 clocks that reach Test-Logic-Reset from any state.
pub const RESET_CLOCKS: usize = 5;

impl JtagState {
    pub const ALL: [JtagState; 16] = [
        Reset, Idle, SelectDR, CaptureDR, ShiftDR, Exit1DR, PauseDR, Exit2DR, UpdateDR, SelectIR,
        CaptureIR, ShiftIR, Exit1IR, PauseIR, Exit2IR, UpdateIR,
    ];

    /// The state reached after one TCK edge with the given TMS level.
    pub fn next(self, tms: bool) -> JtagState {
        TRANSITIONS[self as usize][tms as usize]
    }

    /// Shortest TMS sequence leading from `self` to `to`, see [`path`].
    pub fn path_to(self, to: JtagState) -> Vec<bool> {
        path(self, to)
    }

    fn shift_state(reg: Register) -> JtagState {
        match reg {
            Register::Data => ShiftDR,
            Register::Instruction => ShiftIR,
        }
    }
}

/// Minimum TMS sequence between two states, found by breadth-first search over the transition
/// graph.  Among paths of equal length the one taking TMS=0 edges earliest wins.
pub fn path(from: JtagState, to: JtagState) -> Vec<bool> {
    if from == to {
        return Vec::new();
    }

    // (predecessor, tms) for every visited state
    let mut visited: [Option<(JtagState, bool)>; 16] = [None; 16];
    let mut queue = VecDeque::new();
    visited[from as usize] = Some((from, false));
    queue.push_back(from);

    while let Some(state) = queue.pop_front() {
        for tms in [false, true] {
            let next = state.next(tms);
            if visited[next as usize].is_some() {
                continue;
            }
            visited[next as usize] = Some((state, tms));
            if next == to {
                let mut bits = Vec::new();
                let mut cur = to;
                while cur != from {
                    let (prev, tms) = visited[cur as usize].unwrap_or((from, false));
                    bits.push(tms);
                    cur = prev;
                }
                bits.reverse();
                return bits;
            }
            queue.push_back(next);
        }
    }
    // every state is reachable from every other state
    unreachable!("no TAP path from {:?} to {:?}", from, to)
}

pub struct JtagSM<T> {
    pub cable: T,
    state: JtagState,
    // false after a transport failure left the physical state unknown
    synced: bool,
}

impl<T, U> JtagSM<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// Create a JTAG state machine using an existing `Cable`.  Nothing is clocked until the first
    /// operation, which starts with a reset.
    pub fn new(cable: T) -> Self {
        Self {
            cable,
            state: Reset,
            synced: false,
        }
    }

    /// The state the TAP controllers are in, as far as this side knows.
    pub fn state(&self) -> JtagState {
        self.state
    }

    /// Whether `state()` is known to match the hardware.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Clock one TCK edge with the given TMS level.
    pub fn step(&mut self, tms: bool) -> Result<JtagState, Error> {
        self.clock(&[tms], true)?;
        Ok(self.state)
    }

    /// Reset the scan chain by driving TMS high for 5 clocks
    pub fn reset(&mut self) -> Result<JtagState, Error> {
        self.clock(&[true; RESET_CLOCKS], true)?;
        self.state = Reset;
        self.synced = true;
        Ok(self.state)
    }

    /// Use TMS to get into `state` by the most efficient path
    pub fn goto(&mut self, state: JtagState) -> Result<(), Error> {
        if !self.synced {
            self.reset()?;
        }
        if self.state == state {
            return Ok(());
        }

        let path = path(self.state, state);
        trace!(from = ?self.state, to = ?state, ?path, "tap path");
        self.clock(&path, true)
    }

    /// Spend `cycles` clocks in Run-Test/Idle.
    pub fn idle(&mut self, cycles: usize) -> Result<(), Error> {
        self.goto(Idle)?;
        let tms = vec![false; cycles];
        self.clock(&tms, true)
    }

    /// Shift `tdi` through either the instruction or data register and return what came out on
    /// TDO.  `length` is the length of the register being scanned; a `tdi` of any other length
    /// is a protocol error.  The scan runs Capture, Shift, Exit1, Update and settles in
    /// Run-Test/Idle, all in one transfer.
    pub fn shift_register(&mut self, reg: Register, tdi: &[bool], length: usize) -> Result<Vec<bool>, Error> {
        if length == 0 || tdi.is_empty() {
            return Err(ProtocolError::EmptyScan(reg).into());
        }
        if tdi.len() != length {
            return Err(ProtocolError::LengthMismatch {
                register: reg,
                expected: length,
                actual: tdi.len(),
            }.into());
        }
        if !self.synced {
            self.reset()?;
        }

        let shift = JtagState::shift_state(reg);
        let lead = path(self.state, shift);
        let n = tdi.len();

        // lead-in, n shift clocks (TMS rises on the last), Exit1 -> Update -> Idle
        let mut tms = Vec::with_capacity(lead.len() + n + 2);
        let mut out = Vec::with_capacity(tms.capacity());
        tms.extend_from_slice(&lead);
        out.extend(core::iter::repeat(true).take(lead.len()));
        for (i, bit) in tdi.iter().enumerate() {
            tms.push(i == n - 1);
            out.push(*bit);
        }
        tms.extend_from_slice(&[true, false]);
        out.extend_from_slice(&[true, true]);

        debug!(register = ?reg, bits = n, "scan");
        let tdo = self.transfer(&tms, &out)?;
        Ok(tdo[lead.len()..lead.len() + n].to_vec())
    }

    fn clock(&mut self, tms: &[bool], tdi: bool) -> Result<(), Error> {
        if tms.is_empty() {
            return Ok(());
        }
        let out = vec![tdi; tms.len()];
        self.transfer(tms, &out).map(|_| ())
    }

    fn transfer(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, Error> {
        let tdo = match self.cable.shift(tms, tdi) {
            Ok(tdo) => tdo,
            Err(e) => {
                self.synced = false;
                return Err(e.into());
            }
        };
        if tdo.len() != tms.len() {
            self.synced = false;
            return Err(crate::cable::CableError::ShortRead {
                expected: tms.len(),
                got: tdo.len(),
            }.into());
        }
        self.state = tms.iter().fold(self.state, |s, t| s.next(*t));
        Ok(tdo)
    }
}
