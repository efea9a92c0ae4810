//! Netlist recovery: drive one pin, watch all the others.
//!
//! Every candidate driver is taken high and then low while every other pin is released.  Pins
//! that follow it (high on the first capture, low on the second) are on its net.  Two captures
//! per driver rule out pins that merely sit at the same level, and releasing everything between
//! drivers keeps earlier rounds from masking later ones.
use std::string::{String, ToString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::boundary::BoundaryScan;
use crate::cable::Cable;
use crate::descriptor::PortRole;
use crate::error::{ConfigError, Error};
use crate::netlist::{Netlist, NetlistReport, PinRef};

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanConfig {
    pub skip_jtag_pins: bool,
    pub skip_power_pins: bool,
    /// Only pins whose name (or `device:pin`) matches.
    pub include: Option<String>,
    /// Drop pins whose name (or `device:pin`) matches.
    pub exclude: Option<String>,
    /// Refuse to scan unless the chain has this many devices.
    pub expected_devices: Option<usize>,
    /// Progress records buffered by a worker before new ones are dropped.
    pub progress_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            skip_jtag_pins: true,
            skip_power_pins: true,
            include: None,
            exclude: None,
            expected_devices: None,
            progress_capacity: 64,
        }
    }
}

impl ScanConfig {
    pub fn include(mut self, pattern: &str) -> Self {
        self.include = Some(pattern.to_string());
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.exclude = Some(pattern.to_string());
        self
    }

    pub fn expect(mut self, devices: usize) -> Self {
        self.expected_devices = Some(devices);
        self
    }

    /// Check the configuration and compile its pin filter.  Touches no hardware.
    pub fn validate(&self) -> Result<PinFilter, ConfigError> {
        if self.progress_capacity == 0 {
            return Err(ConfigError::ZeroProgressCapacity);
        }
        if let (Some(inc), Some(exc)) = (&self.include, &self.exclude) {
            if inc == exc {
                return Err(ConfigError::ContradictoryFilters(inc.clone()));
            }
        }
        Ok(PinFilter {
            include: compile(self.include.as_deref())?,
            exclude: compile(self.exclude.as_deref())?,
            skip_jtag: self.skip_jtag_pins,
            skip_power: self.skip_power_pins,
        })
    }
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>, ConfigError> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| ConfigError::InvalidPattern {
                pattern: p.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Compiled candidate filter of a `ScanConfig`.
#[derive(Clone, Debug)]
pub struct PinFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
    skip_jtag: bool,
    skip_power: bool,
}

impl PinFilter {
    pub fn accepts(&self, pin: &PinRef, role: PortRole) -> bool {
        match role {
            PortRole::Jtag if self.skip_jtag => return false,
            PortRole::Power | PortRole::Ground if self.skip_power => return false,
            _ => {}
        }
        let full = pin.to_string();
        let hit = |re: &Regex| re.is_match(&pin.pin) || re.is_match(&full);
        if let Some(re) = &self.exclude {
            if hit(re) {
                return false;
            }
        }
        self.include.as_ref().map_or(true, hit)
    }
}

/// Shared cancellation flag, polled between drivers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Emitted once per driver.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanProgress {
    /// 1-based.
    pub index: usize,
    pub total: usize,
    pub driver: PinRef,
    pub nets_found: usize,
}

pub trait ProgressSink {
    fn progress(&mut self, progress: ScanProgress);
}

impl<F: FnMut(ScanProgress)> ProgressSink for F {
    fn progress(&mut self, progress: ScanProgress) {
        self(progress)
    }
}

pub struct ScanContext<P> {
    pub cancel: CancelToken,
    pub progress: P,
}

impl<P: ProgressSink> ScanContext<P> {
    pub fn new(progress: P) -> Self {
        Self {
            cancel: CancelToken::new(),
            progress,
        }
    }

    pub fn with_cancel(progress: P, cancel: CancelToken) -> Self {
        Self { cancel, progress }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanStatus {
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanOutcome {
    pub netlist: NetlistReport,
    pub status: ScanStatus,
    pub drivers_scanned: usize,
}

/// Drivers and observers, each ordered by device then pin name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanPlan {
    pub drivers: Vec<PinRef>,
    pub observers: Vec<PinRef>,
}

/// Work out which pins a scan would drive and watch.
pub fn plan<T, U>(runtime: &BoundaryScan<T>, config: &ScanConfig, filter: &PinFilter) -> Result<ScanPlan, Error>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    let chain = runtime.chain();
    if let Some(expected) = config.expected_devices {
        if expected != chain.len() {
            return Err(ConfigError::DeviceCountMismatch {
                expected,
                found: chain.len(),
            }.into());
        }
    }
    let role = |pin: &PinRef| {
        chain
            .device(pin.device)
            .and_then(|d| d.descriptor.as_ref())
            .and_then(|d| d.port(&pin.pin))
            .map_or(PortRole::Signal, |p| p.role)
    };
    let keep = |pins: Vec<PinRef>| -> Vec<PinRef> {
        pins.into_iter().filter(|p| filter.accepts(p, role(p))).collect()
    };
    // enabling a shared control cell would drive the other pins behind it as well
    let mut drivers = Vec::new();
    for pin in keep(runtime.drivable_pins()) {
        let siblings = runtime.control_siblings(pin.device, &pin.pin)?;
        if siblings.is_empty() {
            drivers.push(pin);
        } else {
            warn!(%pin, ?siblings, "control cell is shared, pin is only observed");
        }
    }
    let observers = keep(runtime.observable_pins());
    if drivers.is_empty() && observers.is_empty() {
        return Err(ConfigError::EmptyCandidateSet.into());
    }
    if drivers.is_empty() {
        return Err(ConfigError::NoDrivers.into());
    }
    Ok(ScanPlan { drivers, observers })
}

/// Recover the board's netlist.  Configuration is checked before any hardware access.  On
/// cancellation the nets confirmed so far come back with `ScanStatus::Cancelled`; either way
/// every pin is left in high impedance.
pub fn discover_netlist<T, U, P>(
    ctx: &mut ScanContext<P>,
    runtime: &mut BoundaryScan<T>,
    config: &ScanConfig,
) -> Result<ScanOutcome, Error>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized,
          P: ProgressSink
{
    let filter = config.validate()?;
    let plan = plan(runtime, config, &filter)?;
    info!(drivers = plan.drivers.len(), observers = plan.observers.len(), "netlist scan");

    let mut netlist = Netlist::new();
    for pin in plan.drivers.iter().chain(&plan.observers) {
        netlist.add_pin(pin);
    }

    let result = run(ctx, runtime, &plan, &mut netlist);
    runtime.release_all();
    let released = runtime.flush();
    let (status, drivers_scanned) = match (result, released) {
        (Ok(r), Ok(())) => r,
        (Ok(_), Err(e)) => return Err(e),
        (Err(e), released) => {
            if let Err(restore) = released {
                error!(%restore, "could not release pins after failed scan");
            }
            return Err(e);
        }
    };

    let report = netlist.report(runtime.chain().labels());
    info!(?status, drivers_scanned, nets = report.nets.len(), "netlist scan finished");
    Ok(ScanOutcome {
        netlist: report,
        status,
        drivers_scanned,
    })
}

fn run<T, U, P>(
    ctx: &mut ScanContext<P>,
    runtime: &mut BoundaryScan<T>,
    plan: &ScanPlan,
    netlist: &mut Netlist,
) -> Result<(ScanStatus, usize), Error>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized,
          P: ProgressSink
{
    let total = plan.drivers.len();
    for (i, driver) in plan.drivers.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            info!(scanned = i, total, "netlist scan cancelled");
            return Ok((ScanStatus::Cancelled, i));
        }

        runtime.release_all();
        runtime.set_pin(driver.device, &driver.pin, true)?;
        runtime.flush()?;
        let high = snapshot(runtime, &plan.observers)?;
        runtime.set_pin(driver.device, &driver.pin, false)?;
        runtime.flush()?;
        let low = snapshot(runtime, &plan.observers)?;

        let mut followers = Vec::new();
        let mut own = None;
        for (pin, (h, l)) in plan.observers.iter().zip(high.iter().zip(&low)) {
            let toggled = *h && !*l;
            if pin == driver {
                own = Some(toggled);
            } else if toggled {
                followers.push(pin.clone());
            }
        }

        if own == Some(false) {
            warn!(%driver, "driver did not toggle its own pin");
            netlist.mark_undriveable(driver);
        } else {
            netlist.record_round(driver, &followers, &plan.observers);
        }
        debug!(%driver, followers = followers.len(), "round");

        let (_, cells) = runtime.pin(driver.device, &driver.pin)?;
        if cells.control.is_some() {
            runtime.set_hiz(driver.device, &driver.pin)?;
        }
        ctx.progress.progress(ScanProgress {
            index: i + 1,
            total,
            driver: driver.clone(),
            nets_found: netlist.net_count(),
        });
    }
    Ok((ScanStatus::Completed, total))
}

fn snapshot<T, U>(runtime: &BoundaryScan<T>, observers: &[PinRef]) -> Result<Vec<bool>, Error>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    observers
        .iter()
        .map(|p| runtime.read_pin(p.device, &p.pin))
        .collect()
}
