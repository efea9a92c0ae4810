#![cfg(all(feature = "serde", feature = "std"))]

mod common;

use common::{two_mcu_chain, two_mcus};
use jtag_bscan::boundary::{BoundaryScan, PinState};
use jtag_bscan::chain::DiscoveryConfig;
use jtag_bscan::netlist::{NetlistReport, PinRef};
use jtag_bscan::netscan::{discover_netlist, ScanConfig, ScanContext, ScanProgress};
use jtag_bscan::statemachine::JtagSM;

#[test]
fn report_survives_json() {
    let (mut sim, _) = two_mcus();
    sim.connect(&[(0, "PA0"), (1, "PB0")]);
    sim.force(1, "PA1", Some(false));
    let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), two_mcu_chain());
    let mut ctx = ScanContext::new(|_: ScanProgress| {});
    let report = discover_netlist(&mut ctx, &mut bscan, &ScanConfig::default()).unwrap().netlist;
    assert_eq!(report.undriveable, vec![PinRef::new(1, "PA1")]);

    let json = serde_json::to_string(&report).unwrap();
    let back: NetlistReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back, report);
    assert_eq!(back.to_string(), report.to_string());
}

#[test]
fn scan_config_fills_in_defaults() {
    let config: ScanConfig = serde_json::from_str(r#"{"include": "^P", "expected_devices": 2}"#).unwrap();
    assert_eq!(config, ScanConfig::default().include("^P").expect(2));
    assert!(config.skip_jtag_pins);
    assert_eq!(config.progress_capacity, 64);
}

#[test]
fn discovery_config_reads_hints() {
    let config: DiscoveryConfig = serde_json::from_str(r#"{"hints": {"1": "cpld"}}"#).unwrap();
    assert_eq!(config.max_devices, 32);
    assert_eq!(config.expected_devices, None);
    assert_eq!(config.hints.get(&1).map(String::as_str), Some("cpld"));
}

#[test]
fn pin_states_have_stable_names() {
    assert_eq!(serde_json::to_string(&PinState::HighZ).unwrap(), r#""HighZ""#);
    let state: PinState = serde_json::from_str(r#""DriveLow""#).unwrap();
    assert_eq!(state, PinState::DriveLow);
}
