//! Per-device boundary-scan geometry.
//!
//! A `DeviceDescriptor` is what a BSDL file boils down to: IDCODE (with wildcard mask), register
//! lengths, opcodes, ports and the boundary cells wired to them.  Descriptors are produced
//! outside this crate and handed in through a [`DescriptorRepository`].
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::error::ConfigError;

/// A 32-bit IEEE 1149.1 device identification code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdCode(pub u32);

impl IdCode {
    pub fn version(self) -> u8 {
        (self.0 >> 28) as u8
    }

    pub fn part(self) -> u16 {
        ((self.0 >> 12) & 0xffff) as u16
    }

    /// JEDEC manufacturer code, bits 11..1.
    pub fn manufacturer(self) -> u16 {
        ((self.0 >> 1) & 0x7ff) as u16
    }

    /// Bit 0 is always set and 0x7f is not a valid JEDEC low byte.
    pub fn is_valid(self) -> bool {
        self.0 & 1 == 1 && self.manufacturer() & 0x7f != 0x7f
    }

    /// True when `self` agrees with `value` on every bit set in `mask`.
    pub fn matches(self, value: u32, mask: u32) -> bool {
        self.0 & mask == value & mask
    }
}

impl fmt::Display for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl fmt::Debug for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdCode(0x{:08x})", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellFunction {
    /// Observes an input pin.
    Input,
    /// Drives an output that has no enable.
    Output2,
    /// Drives an output gated by a control cell.
    Output3,
    /// A single cell that both drives (gated by a control cell) and observes its pin.
    Bidir,
    /// Output enable for other cells.
    Control,
    Internal,
}

impl CellFunction {
    pub fn observes(self) -> bool {
        matches!(self, CellFunction::Input | CellFunction::Bidir)
    }

    pub fn drives(self) -> bool {
        matches!(self, CellFunction::Output2 | CellFunction::Output3 | CellFunction::Bidir)
    }
}

/// Reference from an output cell to the control cell that enables it.  Writing `disable` into the
/// control cell puts the output in high impedance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlRef {
    pub cell: usize,
    pub disable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundaryCell {
    pub bit: usize,
    pub function: CellFunction,
    pub port: Option<String>,
    pub safe: Option<bool>,
    pub control: Option<ControlRef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortRole {
    Signal,
    /// TCK, TMS, TDI, TDO, TRST.
    Jtag,
    Power,
    Ground,
    NoConnect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub role: PortRole,
    /// Package pin number or ball name.
    pub pin: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    name: String,
    idcode: u32,
    mask: u32,
    ir_len: usize,
    boundary_len: usize,
    cells: Vec<BoundaryCell>,
    ports: Vec<Port>,
    instructions: BTreeMap<String, u64>,
}

impl DeviceDescriptor {
    pub fn builder(name: &str, idcode: u32, mask: u32) -> DescriptorBuilder {
        DescriptorBuilder::new(name, idcode, mask)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn idcode(&self) -> u32 {
        self.idcode
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn ir_len(&self) -> usize {
        self.ir_len
    }

    pub fn boundary_len(&self) -> usize {
        self.boundary_len
    }

    /// Cells ordered by bit position.
    pub fn cells(&self) -> &[BoundaryCell] {
        &self.cells
    }

    pub fn cell(&self, bit: usize) -> Option<&BoundaryCell> {
        self.cells.binary_search_by_key(&bit, |c| c.bit).ok().map(|i| &self.cells[i])
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    /// Resolve a port by name, falling back to its package pin number.
    pub fn resolve_port(&self, name: &str) -> Option<&Port> {
        self.port(name)
            .or_else(|| self.ports.iter().find(|p| p.pin.as_deref() == Some(name)))
    }

    pub fn instruction(&self, name: &str) -> Option<u64> {
        self.instructions.get(name).copied()
    }

    pub fn instructions(&self) -> impl Iterator<Item = (&str, u64)> {
        self.instructions.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn extest(&self) -> Option<u64> {
        self.instruction("EXTEST")
    }

    pub fn sample(&self) -> Option<u64> {
        self.instruction("SAMPLE/PRELOAD").or_else(|| self.instruction("SAMPLE"))
    }

    pub fn preload(&self) -> Option<u64> {
        self.instruction("SAMPLE/PRELOAD").or_else(|| self.instruction("PRELOAD"))
    }

    /// BYPASS is all ones unless the descriptor says otherwise.
    pub fn bypass(&self) -> u64 {
        self.instruction("BYPASS").unwrap_or_else(|| all_ones(self.ir_len))
    }

    pub fn matches(&self, idcode: IdCode) -> bool {
        idcode.matches(self.idcode, self.mask)
    }

    /// Number of IDCODE bits the mask pins down.
    pub fn specificity(&self) -> u32 {
        self.mask.count_ones()
    }
}

pub(crate) fn all_ones(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Builds and validates a `DeviceDescriptor`.  The `input`, `output`, `tristate`, `io` and `bidir`
/// helpers allocate cells at increasing bit positions, creating the port on first use.
pub struct DescriptorBuilder {
    desc: DeviceDescriptor,
    next_bit: usize,
    explicit_len: Option<usize>,
    disable: bool,
}

impl DescriptorBuilder {
    pub fn new(name: &str, idcode: u32, mask: u32) -> Self {
        Self {
            desc: DeviceDescriptor {
                name: name.to_string(),
                idcode,
                mask,
                ir_len: 0,
                boundary_len: 0,
                cells: Vec::new(),
                ports: Vec::new(),
                instructions: BTreeMap::new(),
            },
            next_bit: 0,
            explicit_len: None,
            disable: false,
        }
    }

    pub fn ir_len(mut self, bits: usize) -> Self {
        self.desc.ir_len = bits;
        self
    }

    pub fn instruction(mut self, name: &str, opcode: u64) -> Self {
        self.desc.instructions.insert(name.to_string(), opcode);
        self
    }

    /// Override the boundary length, otherwise it is one past the highest allocated cell.
    pub fn boundary_len(mut self, bits: usize) -> Self {
        self.explicit_len = Some(bits);
        self
    }

    /// Disable value used by control cells allocated from here on.
    pub fn disable_value(mut self, disable: bool) -> Self {
        self.disable = disable;
        self
    }

    pub fn port(mut self, name: &str, role: PortRole) -> Self {
        match self.desc.ports.iter_mut().find(|p| p.name == name) {
            Some(p) => p.role = role,
            None => self.desc.ports.push(Port {
                name: name.to_string(),
                role,
                pin: None,
            }),
        }
        self
    }

    /// Attach a package pin number to a port.
    pub fn pin(mut self, port: &str, pin: &str) -> Self {
        self = self.ensure_port(port);
        if let Some(p) = self.desc.ports.iter_mut().find(|p| p.name == port) {
            p.pin = Some(pin.to_string());
        }
        self
    }

    pub fn cell(mut self, cell: BoundaryCell) -> Self {
        if let Some(port) = cell.port.clone() {
            self = self.ensure_port(&port);
        }
        self.next_bit = self.next_bit.max(cell.bit + 1);
        self.desc.cells.push(cell);
        self
    }

    pub fn input(self, port: &str) -> Self {
        let bit = self.next_bit;
        self.cell(BoundaryCell {
            bit,
            function: CellFunction::Input,
            port: Some(port.to_string()),
            safe: None,
            control: None,
        })
    }

    pub fn output(self, port: &str) -> Self {
        let bit = self.next_bit;
        self.cell(BoundaryCell {
            bit,
            function: CellFunction::Output2,
            port: Some(port.to_string()),
            safe: Some(false),
            control: None,
        })
    }

    /// Control cell followed by an OUTPUT3 cell.
    pub fn tristate(self, port: &str) -> Self {
        let (this, control) = self.control();
        let bit = this.next_bit;
        this.cell(BoundaryCell {
            bit,
            function: CellFunction::Output3,
            port: Some(port.to_string()),
            safe: Some(false),
            control: Some(control),
        })
    }

    /// Control cell, OUTPUT3 cell and a separate INPUT cell on the same port.
    pub fn io(self, port: &str) -> Self {
        self.tristate(port).input(port)
    }

    /// Control cell followed by a single BIDIR cell.
    pub fn bidir(self, port: &str) -> Self {
        let (this, control) = self.control();
        let bit = this.next_bit;
        this.cell(BoundaryCell {
            bit,
            function: CellFunction::Bidir,
            port: Some(port.to_string()),
            safe: Some(false),
            control: Some(control),
        })
    }

    pub fn internal(self) -> Self {
        let bit = self.next_bit;
        self.cell(BoundaryCell {
            bit,
            function: CellFunction::Internal,
            port: None,
            safe: None,
            control: None,
        })
    }

    fn control(self) -> (Self, ControlRef) {
        let bit = self.next_bit;
        let disable = self.disable;
        let this = self.cell(BoundaryCell {
            bit,
            function: CellFunction::Control,
            port: None,
            safe: Some(disable),
            control: None,
        });
        (this, ControlRef { cell: bit, disable })
    }

    fn ensure_port(self, name: &str) -> Self {
        if self.desc.port(name).is_some() {
            self
        } else {
            self.port(name, PortRole::Signal)
        }
    }

    pub fn build(mut self) -> Result<DeviceDescriptor, ConfigError> {
        let name = self.desc.name.clone();
        let invalid = |reason: String| ConfigError::InvalidDescriptor {
            name: name.clone(),
            reason,
        };

        let ir_len = self.desc.ir_len;
        if ir_len == 0 || ir_len > 64 {
            return Err(invalid(alloc::format!("instruction register length {}", ir_len)));
        }
        for (op, code) in &self.desc.instructions {
            if *code > all_ones(ir_len) {
                return Err(invalid(alloc::format!("opcode {} does not fit {} bits", op, ir_len)));
            }
        }

        self.desc.cells.sort_by_key(|c| c.bit);
        let len = self.explicit_len.unwrap_or(self.next_bit);
        for pair in self.desc.cells.windows(2) {
            if pair[0].bit == pair[1].bit {
                return Err(invalid(alloc::format!("cell {} defined twice", pair[0].bit)));
            }
        }
        for cell in &self.desc.cells {
            if cell.bit >= len {
                return Err(invalid(alloc::format!("cell {} beyond boundary length {}", cell.bit, len)));
            }
            if cell.function != CellFunction::Control
                && cell.function != CellFunction::Internal
                && cell.port.is_none()
            {
                return Err(invalid(alloc::format!("cell {} has no port", cell.bit)));
            }
            if let Some(ctrl) = cell.control {
                let ok = self
                    .desc
                    .cells
                    .iter()
                    .any(|c| c.bit == ctrl.cell && c.function == CellFunction::Control);
                if !ok {
                    return Err(invalid(alloc::format!(
                        "cell {} refers to missing control cell {}",
                        cell.bit, ctrl.cell
                    )));
                }
            }
        }
        self.desc.boundary_len = len;
        Ok(self.desc)
    }
}

/// Source of device descriptors, keyed by IDCODE.
pub trait DescriptorRepository {
    /// Every descriptor whose masked IDCODE matches `idcode`.
    fn candidates(&self, idcode: IdCode) -> Vec<Arc<DeviceDescriptor>>;

    fn by_name(&self, name: &str) -> Option<Arc<DeviceDescriptor>>;

    /// The best descriptor for `idcode`: the match with the most specific mask.  Two different
    /// descriptors tied for most specific is a configuration error.
    fn lookup(&self, idcode: IdCode) -> Result<Option<Arc<DeviceDescriptor>>, ConfigError> {
        let candidates = self.candidates(idcode);
        let best = match candidates.iter().map(|d| d.specificity()).max() {
            Some(best) => best,
            None => return Ok(None),
        };
        let mut top: Vec<Arc<DeviceDescriptor>> = candidates
            .into_iter()
            .filter(|d| d.specificity() == best)
            .collect();
        top.sort_by(|a, b| a.name.cmp(&b.name));
        top.dedup_by(|a, b| a.name == b.name);
        if top.len() > 1 {
            return Err(ConfigError::AmbiguousDescriptor {
                idcode,
                candidates: top.iter().map(|d| d.name.clone()).collect(),
            });
        }
        Ok(top.pop())
    }
}

/// In-memory descriptor repository.
#[derive(Clone, Debug, Default)]
pub struct Descriptors {
    list: Vec<Arc<DeviceDescriptor>>,
}

impl Descriptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, desc: DeviceDescriptor) -> Arc<DeviceDescriptor> {
        let desc = Arc::new(desc);
        self.list.push(desc.clone());
        desc
    }

    pub fn with(mut self, desc: DeviceDescriptor) -> Self {
        self.add(desc);
        self
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl DescriptorRepository for Descriptors {
    fn candidates(&self, idcode: IdCode) -> Vec<Arc<DeviceDescriptor>> {
        self.list.iter().filter(|d| d.matches(idcode)).cloned().collect()
    }

    fn by_name(&self, name: &str) -> Option<Arc<DeviceDescriptor>> {
        self.list.iter().find(|d| d.name == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpld(name: &str, idcode: u32, mask: u32) -> DeviceDescriptor {
        DeviceDescriptor::builder(name, idcode, mask)
            .ir_len(4)
            .instruction("EXTEST", 0x0)
            .instruction("IDCODE", 0x1)
            .bidir("PA0")
            .io("PA1")
            .input("CLK")
            .port("TCK", PortRole::Jtag)
            .pin("PA0", "12")
            .build()
            .unwrap()
    }

    #[test]
    fn builder_allocates_cells_in_order() {
        let d = cpld("X", 0x0BA00477, 0x0FFF_FFFF);
        assert_eq!(d.boundary_len(), 6);
        assert_eq!(d.cell(0).unwrap().function, CellFunction::Control);
        assert_eq!(d.cell(1).unwrap().control, Some(ControlRef { cell: 0, disable: false }));
        assert_eq!(d.cell(4).unwrap().port.as_deref(), Some("PA1"));
        assert_eq!(d.resolve_port("12").unwrap().name, "PA0");
        assert_eq!(d.bypass(), 0xf);
        assert_eq!(d.port("TCK").unwrap().role, PortRole::Jtag);
    }

    #[test]
    fn builder_rejects_bad_geometry() {
        let err = DeviceDescriptor::builder("Y", 1, !0)
            .ir_len(2)
            .instruction("EXTEST", 0x7)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDescriptor { .. }));

        let err = DeviceDescriptor::builder("Z", 1, !0)
            .ir_len(2)
            .input("A")
            .boundary_len(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDescriptor { .. }));
    }

    #[test]
    fn most_specific_mask_wins() {
        let repo = Descriptors::new()
            .with(cpld("family", 0x0BA00477, 0x0FFF_0FFF))
            .with(cpld("exact", 0x0BA00477, 0x0FFF_FFFF));
        let hit = repo.lookup(IdCode(0x3BA00477)).unwrap().unwrap();
        assert_eq!(hit.name(), "exact");
        assert!(repo.lookup(IdCode(0x12345677)).unwrap().is_none());
    }

    #[test]
    fn equal_specificity_collision_is_an_error() {
        let repo = Descriptors::new()
            .with(cpld("a", 0x0BA00477, 0x0FFF_FFFF))
            .with(cpld("b", 0x0BA00477, 0x0FFF_FFFF));
        let err = repo.lookup(IdCode(0x0BA00477)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::AmbiguousDescriptor {
                idcode: IdCode(0x0BA00477),
                candidates: alloc::vec!["a".into(), "b".into()],
            }
        );
    }

    #[test]
    fn idcode_fields() {
        let id = IdCode(0x3BA00477);
        assert_eq!(id.version(), 3);
        assert_eq!(id.part(), 0xba00);
        assert_eq!(id.manufacturer(), 0x23b);
        assert!(id.is_valid());
        assert!(!IdCode(0xffff_ffff).is_valid());
        assert_eq!(alloc::format!("{}", id), "0x3ba00477");
    }
}
