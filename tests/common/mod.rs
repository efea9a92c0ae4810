#![allow(dead_code)]

use std::sync::Arc;

use jtag_bscan::cable::sim::{SimCable, SimDevice};
use jtag_bscan::chain::Chain;
use jtag_bscan::descriptor::{DeviceDescriptor, Descriptors, PortRole};

pub const MCU_A: u32 = 0x3BA00477;
pub const MCU_B: u32 = 0x0BA00477;

/// A small microcontroller: two bidirectional pins, one tristate output with its own input cell,
/// a clock input and an observable TCK.
pub fn mcu(name: &str, idcode: u32, mask: u32) -> DeviceDescriptor {
    DeviceDescriptor::builder(name, idcode, mask)
        .ir_len(4)
        .instruction("EXTEST", 0b0000)
        .instruction("SAMPLE/PRELOAD", 0b0010)
        .instruction("IDCODE", 0b1110)
        .instruction("BYPASS", 0b1111)
        .bidir("PA0")
        .bidir("PA1")
        .io("PB0")
        .input("CLK")
        .input("TCK")
        .port("TCK", PortRole::Jtag)
        .port("VDD", PortRole::Power)
        .pin("PA0", "12")
        .build()
        .unwrap()
}

/// Two microcontrollers in a chain, nothing wired yet.
pub fn two_mcus() -> (SimCable, Descriptors) {
    let desc = mcu("mcu", MCU_B, 0x0FFF_FFFF);
    let sim = SimCable::new()
        .with_device(SimDevice::from_descriptor(&desc, MCU_A))
        .with_device(SimDevice::from_descriptor(&desc, MCU_B));
    (sim, Descriptors::new().with(desc))
}

/// The chain `two_mcus` discovers, declared up front.
pub fn two_mcu_chain() -> Chain {
    let desc = Arc::new(mcu("mcu", MCU_B, 0x0FFF_FFFF));
    Chain::from_descriptors(vec![desc.clone(), desc])
}
