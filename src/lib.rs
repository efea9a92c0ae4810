//! This crate drives the pins of a circuit board through its JTAG boundary-scan chain and, from
//! that, recovers how the board is wired.  It works at a few levels of abstraction.  At the
//! lowest level is the Cable trait, which shifts TMS/TDI vectors and returns TDO.  There are
//! cables for FT2232H "jtagkey"-style adapters, SEGGER J-Links and bit-banged GPIOs, plus a
//! simulated board for testing without hardware.
//!
//! The JtagSM keeps track of the state of the TAPs.  You tell it which state you want and it gets
//! there with the fewest clocks, and it scans the instruction and data registers in a single
//! transfer per scan.
//!
//! `chain::discover` reads the IDCODEs off the chain, matches them against a repository of device
//! descriptors (the information a BSDL file carries) and measures the instruction registers.
//! `BoundaryScan` then puts the chain in EXTEST and lets you set, release and read individual
//! pins by name; writes accumulate in memory until `flush`.  Finally `netscan` (with the `std`
//! feature) drives each pin in turn and watches every other one to build a netlist, and
//! `worker` runs that scan on its own thread with progress and cancellation.
//!
//! # Example
//! ```no_run
//! use jtag_bscan::boundary::BoundaryScan;
//! use jtag_bscan::chain::DiscoveryConfig;
//! use jtag_bscan::descriptor::{DeviceDescriptor, Descriptors};
//! use jtag_bscan::netscan::{discover_netlist, ScanConfig, ScanContext, ScanProgress};
//! use jtag_bscan::statemachine::JtagSM;
//!
//! let repo = Descriptors::new().with(
//!     DeviceDescriptor::builder("stm32f4", 0x06413041, 0x0fff_ffff)
//!         .ir_len(5)
//!         .instruction("EXTEST", 0b00000)
//!         .instruction("SAMPLE/PRELOAD", 0b00010)
//!         .bidir("PA0")
//!         .bidir("PA1")
//!         .build()
//!         .unwrap(),
//! );
//! let cable = jtag_bscan::cable::new_from_string("jtagkey", 1 << 20).unwrap();
//! let jtag = JtagSM::new(cable);
//! let mut bscan = BoundaryScan::discover(jtag, &repo, &DiscoveryConfig::default()).unwrap();
//!
//! bscan.set_pin(0, "PA0", true).unwrap();
//! bscan.flush().unwrap();
//! println!("PA1 reads {}", bscan.read_pin(0, "PA1").unwrap());
//!
//! let mut ctx = ScanContext::new(|p: ScanProgress| println!("{}/{}", p.index, p.total));
//! let outcome = discover_netlist(&mut ctx, &mut bscan, &ScanConfig::default()).unwrap();
//! print!("{}", outcome.netlist);
//! ```

#![no_std]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod boundary;
pub mod cable;
pub mod chain;
pub mod descriptor;
pub mod error;
pub mod netlist;
pub mod register;
pub mod statemachine;

#[cfg(feature = "std")]
pub mod netscan;
#[cfg(feature = "std")]
pub mod worker;

pub use error::{Error, Result};
