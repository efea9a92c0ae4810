//! Connectivity recovered from drive-and-observe rounds.
//!
//! Pins are merged with union-find.  Every set that grows past one pin is stamped with the order
//! in which it formed, and nets are numbered from 1 in that order so two scans of the same board
//! number their nets identically.  Contradictory evidence marks a net ambiguous rather than
//! splitting it.
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use tracing::warn;

/// A pin on a particular device of the chain.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PinRef {
    pub device: usize,
    pub pin: String,
}

impl PinRef {
    pub fn new(device: usize, pin: &str) -> Self {
        Self {
            device,
            pin: pin.to_string(),
        }
    }
}

impl fmt::Display for PinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.pin)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Net {
    pub number: usize,
    /// Sorted.
    pub pins: Vec<PinRef>,
    pub ambiguous: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Netlist {
    index: BTreeMap<PinRef, usize>,
    pins: Vec<PinRef>,
    parent: Vec<usize>,
    // meaningful on roots only
    formed: Vec<Option<u64>>,
    ambiguous: Vec<bool>,
    members: Vec<Vec<usize>>,
    // node pairs, lower first, where one was driven and the other did not follow
    apart: BTreeSet<(usize, usize)>,
    next_seq: u64,
    undriveable: BTreeSet<PinRef>,
}

impl Netlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pin as a candidate.  Returns its node.
    pub fn add_pin(&mut self, pin: &PinRef) -> usize {
        if let Some(node) = self.index.get(pin) {
            return *node;
        }
        let node = self.pins.len();
        self.index.insert(pin.clone(), node);
        self.pins.push(pin.clone());
        self.parent.push(node);
        self.formed.push(None);
        self.ambiguous.push(false);
        self.members.push(alloc::vec![node]);
        node
    }

    fn find(&self, mut node: usize) -> usize {
        while self.parent[node] != node {
            node = self.parent[node];
        }
        node
    }

    fn find_compress(&mut self, node: usize) -> usize {
        let root = self.find(node);
        let mut cur = node;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Put `a` and `b` on the same net.
    pub fn connect(&mut self, a: &PinRef, b: &PinRef) {
        let a = self.add_pin(a);
        let b = self.add_pin(b);
        let ra = self.find_compress(a);
        let rb = self.find_compress(b);
        if ra == rb {
            return;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        let formed = match (self.formed[root], self.formed[child]) {
            (Some(x), Some(y)) => x.min(y),
            (Some(x), None) | (None, Some(x)) => x,
            (None, None) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                seq
            }
        };
        let contradicted = self.members[root]
            .iter()
            .any(|x| self.members[child].iter().any(|y| self.apart.contains(&pair(*x, *y))));
        if contradicted {
            warn!(a = %self.pins[a], b = %self.pins[b], "joining pins seen apart in an earlier round");
        }
        let moved = core::mem::take(&mut self.members[child]);
        self.members[root].extend(moved);
        self.parent[child] = root;
        self.formed[root] = Some(formed);
        self.ambiguous[root] |= self.ambiguous[child] || contradicted;
    }

    pub fn same_net(&self, a: &PinRef, b: &PinRef) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(a), Some(b)) => self.find(*a) == self.find(*b),
            _ => false,
        }
    }

    /// Flag the net `pin` is on as ambiguous.
    pub fn mark_ambiguous(&mut self, pin: &PinRef) {
        let node = self.add_pin(pin);
        let root = self.find_compress(node);
        self.ambiguous[root] = true;
    }

    pub fn mark_undriveable(&mut self, pin: &PinRef) {
        self.add_pin(pin);
        self.undriveable.insert(pin.clone());
    }

    /// Fold one drive round into the netlist.  `followers` tracked the driver, `observed` is
    /// every pin that was watched.  A watched pin that did not follow is kept as evidence against
    /// the two sharing a net: if they are joined, now or by a later round, the net is ambiguous.
    pub fn record_round(&mut self, driver: &PinRef, followers: &[PinRef], observed: &[PinRef]) {
        let d = self.add_pin(driver);
        for pin in observed {
            self.add_pin(pin);
        }
        for pin in followers {
            if pin != driver {
                self.connect(driver, pin);
            }
        }
        for pin in observed {
            if pin == driver || followers.contains(pin) {
                continue;
            }
            let node = self.add_pin(pin);
            self.apart.insert(pair(d, node));
            if self.same_net(driver, pin) {
                warn!(%driver, %pin, "pin on the driver's net did not follow it");
                self.mark_ambiguous(driver);
            }
        }
    }

    /// Nets of two or more pins, numbered by formation order.
    pub fn nets(&self) -> Vec<Net> {
        let mut groups: BTreeMap<usize, Vec<PinRef>> = BTreeMap::new();
        for (node, pin) in self.pins.iter().enumerate() {
            groups.entry(self.find(node)).or_default().push(pin.clone());
        }
        let mut nets: Vec<(u64, Net)> = groups
            .into_iter()
            .filter(|(_, pins)| pins.len() > 1)
            .map(|(root, mut pins)| {
                pins.sort();
                let seq = self.formed[root].unwrap_or(u64::MAX);
                (seq, Net { number: 0, pins, ambiguous: self.ambiguous[root] })
            })
            .collect();
        nets.sort_by_key(|(seq, _)| *seq);
        nets.into_iter()
            .enumerate()
            .map(|(i, (_, mut net))| {
                net.number = i + 1;
                net
            })
            .collect()
    }

    pub fn net_count(&self) -> usize {
        self.nets().len()
    }

    /// Candidate pins that joined no net.
    pub fn unconnected(&self) -> Vec<PinRef> {
        let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
        for node in 0..self.pins.len() {
            *sizes.entry(self.find(node)).or_default() += 1;
        }
        let mut out: Vec<PinRef> = (0..self.pins.len())
            .filter(|n| sizes.get(&self.find(*n)) == Some(&1))
            .map(|n| self.pins[n].clone())
            .collect();
        out.sort();
        out
    }

    pub fn undriveable(&self) -> Vec<PinRef> {
        self.undriveable.iter().cloned().collect()
    }

    pub fn report(&self, devices: Vec<String>) -> NetlistReport {
        NetlistReport {
            devices,
            nets: self.nets(),
            unconnected: self.unconnected(),
            undriveable: self.undriveable(),
        }
    }
}

fn pair(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

/// The exported result of a netlist scan.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NetlistReport {
    /// Label of each chain device, by position.
    pub devices: Vec<String>,
    pub nets: Vec<Net>,
    pub unconnected: Vec<PinRef>,
    pub undriveable: Vec<PinRef>,
}

impl fmt::Display for NetlistReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, dev) in self.devices.iter().enumerate() {
            writeln!(f, "device {}: {}", i, dev)?;
        }
        for net in &self.nets {
            write!(f, "net {}", net.number)?;
            if net.ambiguous {
                f.write_str(" (ambiguous)")?;
            }
            f.write_str(":")?;
            for pin in &net.pins {
                write!(f, " {}", pin)?;
            }
            writeln!(f)?;
        }
        if !self.unconnected.is_empty() {
            f.write_str("unconnected:")?;
            for pin in &self.unconnected {
                write!(f, " {}", pin)?;
            }
            writeln!(f)?;
        }
        if !self.undriveable.is_empty() {
            f.write_str("undriveable:")?;
            for pin in &self.undriveable {
                write!(f, " {}", pin)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
