mod common;

use common::{two_mcu_chain, two_mcus};
use jtag_bscan::boundary::BoundaryScan;
use jtag_bscan::cable::sim::{SimCable, SimDevice};
use jtag_bscan::chain::Chain;
use jtag_bscan::descriptor::{BoundaryCell, CellFunction, ControlRef, DeviceDescriptor};
use jtag_bscan::error::{ConfigError, Error};
use jtag_bscan::netlist::{Netlist, PinRef};
use jtag_bscan::netscan::{discover_netlist, CancelToken, ScanConfig, ScanContext, ScanProgress, ScanStatus};
use jtag_bscan::statemachine::JtagSM;
use jtag_bscan::worker::{ScanEvent, ScanSession};
use std::sync::Arc;

fn pin(device: usize, name: &str) -> PinRef {
    PinRef::new(device, name)
}

fn board() -> SimCable {
    let (mut sim, _) = two_mcus();
    sim.connect(&[(0, "PA0"), (1, "PA1")]);
    sim
}

#[test]
fn one_wire_gives_one_net() {
    let mut sim = board();
    let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), two_mcu_chain());
    let mut seen = Vec::new();
    let mut ctx = ScanContext::new(|p: ScanProgress| seen.push(p));
    let outcome = discover_netlist(&mut ctx, &mut bscan, &ScanConfig::default()).unwrap();

    assert_eq!(outcome.status, ScanStatus::Completed);
    assert_eq!(outcome.drivers_scanned, 6);
    let nets = &outcome.netlist.nets;
    assert_eq!(nets.len(), 1);
    assert_eq!(nets[0].number, 1);
    assert_eq!(nets[0].pins, vec![pin(0, "PA0"), pin(1, "PA1")]);
    assert!(!nets[0].ambiguous);
    assert_eq!(
        outcome.netlist.unconnected,
        vec![pin(0, "CLK"), pin(0, "PA1"), pin(0, "PB0"), pin(1, "CLK"), pin(1, "PA0"), pin(1, "PB0")]
    );
    assert!(outcome.netlist.undriveable.is_empty());
    assert_eq!(outcome.netlist.devices, vec!["mcu", "mcu"]);

    drop(ctx);
    assert_eq!(seen.len(), 6);
    assert_eq!(seen[0].driver, pin(0, "PA0"));
    assert_eq!(seen[0].nets_found, 1);
    assert_eq!(seen[5].index, 6);
    assert_eq!(seen[5].total, 6);

    drop(bscan);
    assert!(sim.driven_pins().is_empty());
}

#[test]
fn numbering_is_reproducible() {
    let run = || {
        let mut sim = board();
        sim.connect(&[(0, "PB0"), (1, "PB0"), (1, "CLK")]);
        let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), two_mcu_chain());
        let mut ctx = ScanContext::new(|_: ScanProgress| {});
        discover_netlist(&mut ctx, &mut bscan, &ScanConfig::default()).unwrap().netlist
    };
    let first = run();
    assert_eq!(first.nets.len(), 2);
    assert_eq!(first.nets[1].pins, vec![pin(0, "PB0"), pin(1, "CLK"), pin(1, "PB0")]);
    assert_eq!(first, run());
    assert_eq!(first.to_string(), run().to_string());
}

#[test]
fn cancelling_keeps_confirmed_nets_and_releases_pins() {
    let mut sim = board();
    sim.connect(&[(0, "PB0"), (1, "PB0")]);
    let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), two_mcu_chain());
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let mut ctx = ScanContext::with_cancel(move |_: ScanProgress| trigger.cancel(), cancel);
    let outcome = discover_netlist(&mut ctx, &mut bscan, &ScanConfig::default()).unwrap();

    assert_eq!(outcome.status, ScanStatus::Cancelled);
    assert_eq!(outcome.drivers_scanned, 1);
    assert_eq!(outcome.netlist.nets.len(), 1);
    assert_eq!(outcome.netlist.nets[0].pins, vec![pin(0, "PA0"), pin(1, "PA1")]);
    drop(bscan);
    assert!(sim.driven_pins().is_empty());
}

#[test]
fn pin_that_cannot_move_is_undriveable() {
    let mut sim = board();
    sim.force(1, "PB0", Some(true));
    let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), two_mcu_chain());
    let mut ctx = ScanContext::new(|_: ScanProgress| {});
    let outcome = discover_netlist(&mut ctx, &mut bscan, &ScanConfig::default()).unwrap();
    assert_eq!(outcome.netlist.undriveable, vec![pin(1, "PB0")]);
    assert_eq!(outcome.netlist.nets.len(), 1);
}

#[test]
fn filters_narrow_the_candidates() {
    let mut sim = board();
    let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), two_mcu_chain());
    let mut ctx = ScanContext::new(|_: ScanProgress| {});
    let config = ScanConfig::default().include("^PA").exclude("^1:");
    let outcome = discover_netlist(&mut ctx, &mut bscan, &config).unwrap();
    assert_eq!(outcome.drivers_scanned, 2);
    // the far end of the wire is filtered out, so nothing is seen to follow
    assert!(outcome.netlist.nets.is_empty());
    assert_eq!(outcome.netlist.unconnected, vec![pin(0, "PA0"), pin(0, "PA1")]);
}

#[test]
fn jtag_pins_are_skipped_unless_asked_for() {
    let mut sim = board();
    let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), two_mcu_chain());
    let mut ctx = ScanContext::new(|_: ScanProgress| {});
    let outcome = discover_netlist(&mut ctx, &mut bscan, &ScanConfig::default()).unwrap();
    assert!(!outcome.netlist.unconnected.contains(&pin(0, "TCK")));

    let config = ScanConfig {
        skip_jtag_pins: false,
        ..ScanConfig::default()
    };
    let outcome = discover_netlist(&mut ctx, &mut bscan, &config).unwrap();
    assert!(outcome.netlist.unconnected.contains(&pin(0, "TCK")));
}

#[test]
fn pins_behind_a_shared_enable_are_only_observed() {
    let shared = |bit, port: &str| BoundaryCell {
        bit,
        function: CellFunction::Bidir,
        port: Some(port.to_string()),
        safe: Some(false),
        control: Some(ControlRef { cell: 0, disable: false }),
    };
    let desc = DeviceDescriptor::builder("bus", 0x0000_2001, !0)
        .ir_len(2)
        .instruction("EXTEST", 0)
        .instruction("SAMPLE/PRELOAD", 1)
        .cell(BoundaryCell {
            bit: 0,
            function: CellFunction::Control,
            port: None,
            safe: Some(false),
            control: None,
        })
        .cell(shared(1, "D0"))
        .cell(shared(2, "D1"))
        .bidir("OE")
        .build()
        .unwrap();
    let mut sim = SimCable::new().with_device(SimDevice::from_descriptor(&desc, 0x0000_2001));
    sim.connect(&[(0, "OE"), (0, "D1")]);
    let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), Chain::from_descriptors(vec![Arc::new(desc)]));
    let mut ctx = ScanContext::new(|_: ScanProgress| {});
    let outcome = discover_netlist(&mut ctx, &mut bscan, &ScanConfig::default()).unwrap();

    assert_eq!(outcome.drivers_scanned, 1);
    assert_eq!(outcome.netlist.nets.len(), 1);
    assert_eq!(outcome.netlist.nets[0].pins, vec![pin(0, "D1"), pin(0, "OE")]);
    assert_eq!(outcome.netlist.unconnected, vec![pin(0, "D0")]);
}

#[test]
fn reverse_contradiction_marks_the_net() {
    let (x, d) = (pin(0, "PA0"), pin(1, "PB0"));
    let watched = [x.clone(), d.clone()];
    let mut netlist = Netlist::new();
    netlist.record_round(&x, &[], &watched);
    netlist.record_round(&d, &[x.clone()], &watched);
    let report = netlist.report(vec!["mcu".into(), "mcu".into()]);
    assert_eq!(report.nets.len(), 1);
    assert!(report.nets[0].ambiguous);
    assert!(report.to_string().contains("net 1 (ambiguous): 0:PA0 1:PB0"));
}

#[test]
fn bad_configuration_touches_no_hardware() {
    let mut sim = board();
    {
        let mut bscan = BoundaryScan::new(JtagSM::new(&mut sim), two_mcu_chain());
        let mut ctx = ScanContext::new(|_: ScanProgress| {});
        let cases = [
            (ScanConfig::default().include("^NOPE$"), ConfigError::EmptyCandidateSet),
            (ScanConfig::default().include("^CLK$"), ConfigError::NoDrivers),
            (ScanConfig::default().expect(3), ConfigError::DeviceCountMismatch { expected: 3, found: 2 }),
            (
                ScanConfig::default().include("PA").exclude("PA"),
                ConfigError::ContradictoryFilters("PA".into()),
            ),
        ];
        for (config, expected) in cases {
            match discover_netlist(&mut ctx, &mut bscan, &config) {
                Err(Error::Configuration(e)) => assert_eq!(e, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
    assert_eq!(sim.clocks(), 0);
}

fn session() -> ScanSession<Box<SimCable>> {
    ScanSession::new(BoundaryScan::new(JtagSM::new(Box::new(board())), two_mcu_chain()))
}

#[test]
fn worker_streams_progress_then_finishes() {
    let session = session();
    let handle = session.start_netlist_scan(ScanConfig::default()).unwrap();
    let events = handle.events().clone();
    let outcome = handle.join().unwrap();
    assert_eq!(outcome.netlist.nets.len(), 1);

    let events: Vec<ScanEvent> = events.try_iter().collect();
    assert_eq!(events.len(), 7);
    assert!(matches!(events[0], ScanEvent::Progress(ScanProgress { index: 1, total: 6, .. })));
    assert_eq!(events[6], ScanEvent::Finished(ScanStatus::Completed));
}

#[test]
fn small_channel_keeps_the_final_event() {
    let session = session();
    let config = ScanConfig {
        progress_capacity: 2,
        ..ScanConfig::default()
    };
    let handle = session.start_netlist_scan(config).unwrap();
    let events = handle.events().clone();
    handle.join().unwrap();

    let events: Vec<ScanEvent> = events.try_iter().collect();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], ScanEvent::Progress(ScanProgress { index: 1, .. })));
    assert_eq!(events[1], ScanEvent::Finished(ScanStatus::Completed));
}

#[test]
fn second_scan_is_rejected_while_busy() {
    let session = session();
    let (release, wait) = crossbeam_channel::bounded::<()>(0);
    let job = session.spawn(move |_| wait.recv().map_err(|_| Error::Busy)).unwrap();

    assert!(session.is_busy());
    assert!(matches!(session.start_netlist_scan(ScanConfig::default()), Err(Error::Busy)));
    assert!(matches!(session.with_runtime(|_| Ok(())), Err(Error::Busy)));

    release.send(()).unwrap();
    job.join().unwrap().unwrap();
    assert!(!session.is_busy());
    let outcome = session.start_netlist_scan(ScanConfig::default()).unwrap().join().unwrap();
    assert_eq!(outcome.status, ScanStatus::Completed);
}

#[test]
fn worker_scan_can_be_cancelled() {
    let session = session();
    let (release, wait) = crossbeam_channel::bounded::<()>(0);
    // hold the runtime so the scan cannot start before it is cancelled
    let blocker = {
        let s = session.clone();
        std::thread::spawn(move || s.with_runtime(|_| wait.recv().map_err(|_| Error::Busy)))
    };
    while !session.is_busy() {
        std::thread::yield_now();
    }
    assert!(matches!(session.start_netlist_scan(ScanConfig::default()), Err(Error::Busy)));
    release.send(()).unwrap();
    blocker.join().unwrap().unwrap();

    let handle = session.start_netlist_scan(ScanConfig::default()).unwrap();
    handle.cancel();
    let outcome = handle.join().unwrap();
    assert!(outcome.drivers_scanned <= 6);
    session
        .with_runtime(|rt| {
            assert!(rt.jtag().cable.driven_pins().is_empty());
            Ok(())
        })
        .unwrap();
}
