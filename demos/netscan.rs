use std::error::Error;

use jtag_bscan::boundary::BoundaryScan;
use jtag_bscan::cable;
use jtag_bscan::chain::DiscoveryConfig;
use jtag_bscan::descriptor::{DeviceDescriptor, Descriptors};
use jtag_bscan::netscan::{ScanConfig, ScanProgress};
use jtag_bscan::statemachine::JtagSM;
use jtag_bscan::worker::{ScanEvent, ScanSession};

fn descriptors() -> Result<Descriptors, Box<dyn Error>> {
    let stm32 = DeviceDescriptor::builder("stm32f405-bsc", 0x06413041, 0x0fff_ffff)
        .ir_len(5)
        .instruction("EXTEST", 0b00000)
        .instruction("SAMPLE/PRELOAD", 0b00010)
        .instruction("IDCODE", 0b00001)
        .instruction("BYPASS", 0b11111)
        .bidir("PA0")
        .bidir("PA1")
        .bidir("PA2")
        .bidir("PA3")
        .build()?;
    Ok(Descriptors::new().with(stm32))
}

fn main() -> Result<(), Box<dyn Error>> {
    let cable = cable::new_from_string("jtagkey", 1 << 20)?;
    let jtag = JtagSM::new(cable);
    let bscan = BoundaryScan::discover(jtag, &descriptors()?, &DiscoveryConfig::default())?;
    for dev in bscan.chain().devices() {
        println!("{}: {}", dev.position, dev.label());
    }

    let session = ScanSession::new(bscan);
    let handle = session.start_netlist_scan(ScanConfig::default())?;
    for event in handle.events().iter() {
        match event {
            ScanEvent::Progress(ScanProgress { index, total, driver, nets_found }) => {
                println!("[{}/{}] {} ({} nets)", index, total, driver, nets_found)
            }
            ScanEvent::Finished(status) => println!("{:?}", status),
            ScanEvent::Failed(e) => println!("failed: {}", e),
        }
    }
    let outcome = handle.join()?;
    print!("{}", outcome.netlist);
    Ok(())
}
