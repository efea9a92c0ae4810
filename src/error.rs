//! Error taxonomy shared by every layer above the cable.
//!
//! Cable implementations report [`CableError`]; everything from the TAP engine upwards returns
//! [`Error`].  A cancelled netlist scan is not an error, see `netscan::ScanStatus`.
use alloc::string::String;
use alloc::vec::Vec;
use thiserror::Error;

use crate::descriptor::IdCode;
use crate::statemachine::Register;

pub use crate::cable::CableError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] CableError),

    #[error("chain discovery failed: {0}")]
    ChainDiscovery(#[from] DiscoveryError),

    #[error("device {position} ({}) has no resolved descriptor", display_idcode(.idcode))]
    UnresolvedDevice {
        position: usize,
        idcode: Option<IdCode>,
    },

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("pin error: {0}")]
    Pin(#[from] PinError),

    #[error("a scan is already active on this session")]
    Busy,
}

fn display_idcode(idcode: &Option<IdCode>) -> String {
    match idcode {
        Some(id) => alloc::format!("{}", id),
        None => String::from("bypass only"),
    }
}

/// Violations of the TAP protocol.  These indicate a logic bug in the caller and are never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{register:?} scan of {actual} bits, register is {expected} bits long")]
    LengthMismatch {
        register: Register,
        expected: usize,
        actual: usize,
    },

    #[error("{0:?} scan of zero bits")]
    EmptyScan(Register),

    #[error("descriptor {device} has no {instruction} instruction")]
    MissingInstruction {
        device: String,
        instruction: &'static str,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no devices found on the scan chain")]
    NoDevices,

    #[error("expected {expected} devices, IDCODE stream holds {found}")]
    Misaligned { expected: usize, found: usize },

    #[error("expected {expected} devices, more follow them on the chain")]
    TrailingDevices { expected: usize },

    #[error("no all-ones flush pattern within {bits} bits")]
    NoFlushPattern { bits: usize },

    #[error("instruction registers did not flush within {bits} bits")]
    IrNotFlushed { bits: usize },

    #[error("measured instruction register total of {measured} bits, descriptors declare {declared}")]
    IrLengthMismatch { measured: usize, declared: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no candidate pins left after filtering")]
    EmptyCandidateSet,

    #[error("no candidate pin can be driven")]
    NoDrivers,

    #[error("include and exclude filters are identical: {0}")]
    ContradictoryFilters(String),

    #[error("invalid pin filter {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("expected {expected} devices, chain has {found}")]
    DeviceCountMismatch { expected: usize, found: usize },

    #[error("{idcode} matches {} descriptors equally well; add a hint", .candidates.join(", "))]
    AmbiguousDescriptor {
        idcode: IdCode,
        candidates: Vec<String>,
    },

    #[error("hint for device {position} names unknown descriptor {name}")]
    UnknownHint { position: usize, name: String },

    #[error("hint for device {position}: descriptor {name} does not match {idcode}")]
    HintMismatch {
        position: usize,
        name: String,
        idcode: IdCode,
    },

    #[error("invalid descriptor {name}: {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("progress capacity must be at least 1")]
    ZeroProgressCapacity,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PinError {
    #[error("device {0} is not on the chain")]
    NoSuchDevice(usize),

    #[error("device {device} has no pin {pin}")]
    UnknownPin { device: usize, pin: String },

    #[error("pin {pin} of device {device} has no output cell")]
    NoOutputCell { device: usize, pin: String },

    #[error("pin {pin} of device {device} has no output-enable cell")]
    NoControlCell { device: usize, pin: String },

    #[error("pin {pin} of device {device} has no observe cell")]
    NoObserveCell { device: usize, pin: String },
}

pub type Result<T> = core::result::Result<T, Error>;
