//! Scan chain assembly.  `discover` resets the TAPs, reads back every device's IDCODE, resolves
//! each one against a descriptor repository and measures the instruction registers, producing a
//! `Chain`: the ordered devices plus the geometry of the composite instruction and data registers
//! used while the chain is in EXTEST.
//!
//! Positions count from TDI: device 0 is the first device the TDI pin feeds.  Composite register
//! offsets grow with position.  Because the first bit shifted in travels furthest, the serial
//! stream visits the devices from the TDO end backwards; `to_stream` and `from_stream` convert.
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use tracing::{debug, info, warn};

use crate::cable::Cable;
use crate::descriptor::{DescriptorRepository, DeviceDescriptor, IdCode};
use crate::error::{ConfigError, DiscoveryError, Error};
use crate::register::RegisterImage;
use crate::statemachine::{JtagSM, Register};

const IDCODE_BITS: usize = 32;

#[derive(Clone, Debug)]
pub struct ChainDevice {
    pub position: usize,
    /// `None` for a device that comes out of reset in BYPASS.
    pub idcode: Option<IdCode>,
    pub descriptor: Option<Arc<DeviceDescriptor>>,
    pub ir_len: Option<usize>,
    pub ir_offset: Option<usize>,
    /// Boundary length for resolved devices, 1 (BYPASS) otherwise.
    pub dr_len: usize,
    pub dr_offset: usize,
}

impl ChainDevice {
    pub fn is_resolved(&self) -> bool {
        self.descriptor.is_some()
    }

    /// The descriptor if this device takes part in EXTEST, otherwise an `UnresolvedDevice` error.
    pub fn boundary(&self) -> Result<&DeviceDescriptor, Error> {
        match &self.descriptor {
            Some(d) if d.boundary_len() > 0 && self.ir_offset.is_some() => Ok(d),
            _ => Err(self.unresolved()),
        }
    }

    pub(crate) fn unresolved(&self) -> Error {
        Error::UnresolvedDevice {
            position: self.position,
            idcode: self.idcode,
        }
    }

    /// Descriptor name, else the IDCODE, else "bypass".
    pub fn label(&self) -> String {
        match (&self.descriptor, self.idcode) {
            (Some(d), _) => String::from(d.name()),
            (None, Some(id)) => alloc::format!("{}", id),
            (None, None) => String::from("bypass"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Chain {
    devices: Vec<ChainDevice>,
    ir_len: Option<usize>,
    dr_len: usize,
}

impl Chain {
    /// `ir_total` is the measured instruction register total.  Devices whose instruction register
    /// cannot be placed from either end of the chain stay out of EXTEST.
    fn build(
        entries: Vec<(Option<IdCode>, Option<Arc<DeviceDescriptor>>, Option<usize>)>,
        ir_total: Option<usize>,
    ) -> Self {
        let mut ir_offsets: Vec<Option<usize>> = vec![None; entries.len()];
        let mut offset = 0;
        for (slot, (_, _, ir_len)) in ir_offsets.iter_mut().zip(&entries) {
            let Some(len) = ir_len else { break };
            *slot = Some(offset);
            offset += len;
        }
        let ir_total = ir_total.or_else(|| entries.iter().map(|e| e.2).sum());
        if let Some(total) = ir_total {
            // from the TDO end, against the total
            let mut end = total;
            for (slot, (_, _, ir_len)) in ir_offsets.iter_mut().zip(&entries).rev() {
                let Some(start) = ir_len.and_then(|len| end.checked_sub(len)) else { break };
                *slot = Some(start);
                end = start;
            }
        }

        let mut devices = Vec::with_capacity(entries.len());
        let mut dr_offset = 0;
        for (position, ((idcode, descriptor, ir_len), ir_offset)) in entries.into_iter().zip(ir_offsets).enumerate() {
            let dr_len = match &descriptor {
                Some(d) if d.boundary_len() > 0 && ir_offset.is_some() => d.boundary_len(),
                _ => 1,
            };
            devices.push(ChainDevice {
                position,
                idcode,
                descriptor,
                ir_len,
                ir_offset,
                dr_len,
                dr_offset,
            });
            dr_offset += dr_len;
        }
        Self {
            devices,
            ir_len: ir_total,
            dr_len: dr_offset,
        }
    }

    /// Declare a chain of known devices without touching hardware, position 0 first.
    pub fn from_descriptors(descriptors: Vec<Arc<DeviceDescriptor>>) -> Self {
        let entries = descriptors
            .into_iter()
            .map(|d| {
                let ir = Some(d.ir_len());
                (Some(IdCode(d.idcode())), Some(d), ir)
            })
            .collect();
        Self::build(entries, None)
    }

    pub fn devices(&self) -> &[ChainDevice] {
        &self.devices
    }

    pub fn device(&self, position: usize) -> Option<&ChainDevice> {
        self.devices.get(position)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Total instruction register length.  Known for every discovered chain, even when some
    /// devices' own lengths are not.
    pub fn ir_len(&self) -> Option<usize> {
        self.ir_len
    }

    /// Total data register length with every resolved device in EXTEST.
    pub fn dr_len(&self) -> usize {
        self.dr_len
    }

    pub fn register_len(&self, reg: Register) -> Result<usize, Error> {
        match reg {
            Register::Data => Ok(self.dr_len),
            Register::Instruction => match self.ir_len {
                Some(len) => Ok(len),
                None => Err(self.first_unknown_ir()),
            },
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.label()).collect()
    }

    fn first_unknown_ir(&self) -> Error {
        match self.devices.iter().find(|d| d.ir_len.is_none()) {
            Some(d) => d.unresolved(),
            None => Error::UnresolvedDevice { position: 0, idcode: None },
        }
    }

    // (offset, len) per device in the order the bits cross TDI/TDO.  Instruction bits of devices
    // that could not be placed form one segment per gap.
    fn segments(&self, reg: Register) -> Result<Vec<(usize, usize)>, Error> {
        let mut segs = Vec::with_capacity(self.devices.len());
        if reg == Register::Data {
            segs.extend(self.devices.iter().rev().map(|d| (d.dr_offset, d.dr_len)));
            return Ok(segs);
        }
        let mut end = self.register_len(Register::Instruction)?;
        for dev in self.devices.iter().rev() {
            let (Some(o), Some(l)) = (dev.ir_offset, dev.ir_len) else { continue };
            if o + l < end {
                segs.push((o + l, end - o - l));
            }
            segs.push((o, l));
            end = o;
        }
        if end > 0 {
            segs.push((0, end));
        }
        Ok(segs)
    }

    /// Serialise a composite image into the order it must be shifted.
    pub fn to_stream(&self, reg: Register, image: &RegisterImage) -> Result<Vec<bool>, Error> {
        let mut bits = Vec::with_capacity(image.len());
        for (offset, len) in self.segments(reg)? {
            bits.extend(image.slice(offset, len));
        }
        Ok(bits)
    }

    /// Rebuild a composite image from the bits that came out of TDO.
    pub fn from_stream(&self, reg: Register, bits: &[bool]) -> Result<RegisterImage, Error> {
        let mut image = RegisterImage::new(bits.len());
        let mut cursor = 0;
        for (offset, len) in self.segments(reg)? {
            for i in 0..len {
                image.set(offset + i, bits[cursor + i]);
            }
            cursor += len;
        }
        Ok(image)
    }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DiscoveryConfig {
    /// Number of devices the board should have.  Unknown counts are probed up to `max_devices`.
    pub expected_devices: Option<usize>,
    pub max_devices: usize,
    /// Upper bound on the summed instruction register length.
    pub max_ir_bits: usize,
    /// Descriptor name to use for the device at a position, overriding IDCODE lookup.
    pub hints: BTreeMap<usize, String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            expected_devices: None,
            max_devices: 32,
            max_ir_bits: 1024,
            hints: BTreeMap::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn expect(mut self, devices: usize) -> Self {
        self.expected_devices = Some(devices);
        self
    }

    pub fn hint(mut self, position: usize, descriptor: &str) -> Self {
        self.hints.insert(position, String::from(descriptor));
        self
    }
}

/// Identify every device on the chain and work out the composite register geometry.
pub fn discover<T, U>(
    jtag: &mut JtagSM<T>,
    repo: &dyn DescriptorRepository,
    config: &DiscoveryConfig,
) -> Result<Chain, Error>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    jtag.reset()?;
    let ids = read_idcodes(jtag, config)?;
    let resolved = resolve(&ids, repo, config)?;
    let (total_ir, capture) = measure_ir(jtag, config.max_ir_bits)?;
    let ir_lens = assign_ir_lengths(&resolved, total_ir, &capture)?;
    jtag.reset()?;

    let entries = ids
        .into_iter()
        .zip(resolved)
        .zip(ir_lens)
        .map(|((id, desc), ir)| (id, desc, ir))
        .collect();
    let chain = Chain::build(entries, Some(total_ir));
    for dev in chain.devices() {
        info!(
            position = dev.position,
            device = %dev.label(),
            ir_len = ?dev.ir_len,
            dr_offset = dev.dr_offset,
            dr_len = dev.dr_len,
            "chain device"
        );
    }
    Ok(chain)
}

fn word(bits: &[bool]) -> u32 {
    bits.iter().enumerate().fold(0, |acc, (i, b)| acc | ((*b as u32) << i))
}

/// IDCODEs in position order.  With the reset instruction loaded, a device with an IDCODE
/// register shifts out 32 bits starting with a 1, a device without one shifts out a single 0.
fn read_idcodes<T, U>(jtag: &mut JtagSM<T>, config: &DiscoveryConfig) -> Result<Vec<Option<IdCode>>, Error>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    if config.expected_devices == Some(0) {
        return Err(DiscoveryError::NoDevices.into());
    }
    let limit = config.expected_devices.unwrap_or(config.max_devices);
    let budget = IDCODE_BITS * limit + IDCODE_BITS;
    let tdo = jtag.shift_register(Register::Data, &vec![true; budget], budget)?;

    let mut ids = Vec::new();
    let mut pos = 0;
    let mut flushed = false;
    while ids.len() < limit && pos < budget {
        if !tdo[pos] {
            ids.push(None);
            pos += 1;
            continue;
        }
        if pos + IDCODE_BITS > budget {
            break;
        }
        let id = word(&tdo[pos..pos + IDCODE_BITS]);
        if id == u32::MAX {
            flushed = true;
            break;
        }
        let id = IdCode(id);
        if !id.is_valid() {
            warn!(idcode = %id, "IDCODE with reserved manufacturer");
        }
        debug!(idcode = %id, "found device");
        ids.push(Some(id));
        pos += IDCODE_BITS;
    }

    let flushed = flushed
        || (pos + IDCODE_BITS <= budget && tdo[pos..pos + IDCODE_BITS].iter().all(|b| *b));
    match config.expected_devices {
        Some(expected) if ids.len() != expected => {
            return Err(DiscoveryError::Misaligned {
                expected,
                found: ids.len(),
            }.into());
        }
        Some(expected) if !flushed => {
            return Err(DiscoveryError::TrailingDevices { expected }.into());
        }
        None if !flushed => {
            return Err(DiscoveryError::NoFlushPattern { bits: budget }.into());
        }
        _ => {}
    }
    if ids.is_empty() {
        return Err(DiscoveryError::NoDevices.into());
    }

    // the device closest to TDO came out first
    ids.reverse();
    Ok(ids)
}

fn resolve(
    ids: &[Option<IdCode>],
    repo: &dyn DescriptorRepository,
    config: &DiscoveryConfig,
) -> Result<Vec<Option<Arc<DeviceDescriptor>>>, Error> {
    let mut out = Vec::with_capacity(ids.len());
    for (position, id) in ids.iter().enumerate() {
        let desc = if let Some(name) = config.hints.get(&position) {
            let desc = repo.by_name(name).ok_or_else(|| ConfigError::UnknownHint {
                position,
                name: name.clone(),
            })?;
            if let Some(id) = id {
                if !desc.matches(*id) {
                    return Err(ConfigError::HintMismatch {
                        position,
                        name: name.clone(),
                        idcode: *id,
                    }.into());
                }
            }
            Some(desc)
        } else if let Some(id) = id {
            repo.lookup(*id)?
        } else {
            None
        };
        if desc.is_none() {
            let err = Error::UnresolvedDevice { position, idcode: *id };
            warn!(%err, "leaving device in BYPASS");
        }
        out.push(desc);
    }
    Ok(out)
}

/// Total instruction register length and the captured IR bits.  Zeros fill every IR, then ones
/// follow; the first one to reappear on TDO marks the total length.  Ones must keep coming after
/// it, otherwise the registers are longer than `max` and captured bits are still draining.
fn measure_ir<T, U>(jtag: &mut JtagSM<T>, max: usize) -> Result<(usize, Vec<bool>), Error>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    let mut tdi = vec![false; max];
    tdi.extend(core::iter::repeat(true).take(max));
    let tdo = jtag.shift_register(Register::Instruction, &tdi, 2 * max)?;
    let window = &tdo[max..];
    let total = window
        .iter()
        .position(|b| *b)
        .filter(|first| window[*first..].iter().all(|b| *b))
        .ok_or(DiscoveryError::IrNotFlushed { bits: 2 * max })?;
    if total == 0 {
        return Err(DiscoveryError::NoDevices.into());
    }
    debug!(total, "instruction register total");
    Ok((total, tdo[..total].to_vec()))
}

fn assign_ir_lengths(
    resolved: &[Option<Arc<DeviceDescriptor>>],
    total: usize,
    capture: &[bool],
) -> Result<Vec<Option<usize>>, Error> {
    let mut lens: Vec<Option<usize>> = resolved.iter().map(|d| d.as_ref().map(|d| d.ir_len())).collect();
    let declared: usize = lens.iter().flatten().sum();
    let unknown: Vec<usize> = (0..lens.len()).filter(|i| lens[*i].is_none()).collect();

    match unknown.len() {
        0 if declared != total => {
            return Err(DiscoveryError::IrLengthMismatch { measured: total, declared }.into());
        }
        0 => {}
        1 => {
            if total <= declared {
                return Err(DiscoveryError::IrLengthMismatch { measured: total, declared }.into());
            }
            lens[unknown[0]] = Some(total - declared);
        }
        _ => match split_capture(&lens, capture) {
            Some(split) => {
                info!(?split, "instruction lengths of unresolved devices split from capture pattern");
                lens = split.into_iter().map(Some).collect();
            }
            None => warn!("capture pattern allows several splits, instruction lengths left unknown"),
        },
    }

    // every IR captures ...01
    let mut cursor = 0;
    for (position, len) in lens.iter().enumerate().rev() {
        let Some(len) = len else { break };
        if capture.get(cursor) != Some(&true) || (*len > 1 && capture.get(cursor + 1) != Some(&false)) {
            warn!(position, "instruction register capture is not ...01");
        }
        cursor += len;
    }
    Ok(lens)
}

/// Split the captured IR bits between the devices, walking from the TDO end.  Every register
/// starts `1, 0` on the wire and one of unknown length is at least two bits long.  Returns the
/// lengths only when exactly one split fits.
fn split_capture(lens: &[Option<usize>], capture: &[bool]) -> Option<Vec<usize>> {
    let mut found = Vec::new();
    let mut out = vec![0; lens.len()];
    fits(lens, capture, lens.len(), 0, &mut out, &mut found);
    match found.len() {
        1 => found.pop(),
        _ => None,
    }
}

// Devices below `position` are still to be placed, starting at `cursor`.  Stops after two splits.
fn fits(
    lens: &[Option<usize>],
    capture: &[bool],
    position: usize,
    cursor: usize,
    out: &mut [usize],
    found: &mut Vec<Vec<usize>>,
) {
    if found.len() > 1 {
        return;
    }
    let Some(position) = position.checked_sub(1) else {
        if cursor == capture.len() {
            found.push(out.to_vec());
        }
        return;
    };
    if capture.get(cursor) != Some(&true) {
        return;
    }
    let rest = capture.len() - cursor;
    let choices = match lens[position] {
        Some(len) => len..len + 1,
        None if position == 0 => rest.max(2)..rest + 1,
        None => 2..rest + 1,
    };
    for len in choices {
        if len > rest || (len > 1 && capture[cursor + 1]) {
            continue;
        }
        out[position] = len;
        fits(lens, capture, position, cursor + len, out, found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimCable, SimDevice};
    use crate::descriptor::Descriptors;

    fn arm(name: &str) -> DeviceDescriptor {
        DeviceDescriptor::builder(name, 0x0BA00477, 0x0FFF_FFFF)
            .ir_len(4)
            .instruction("EXTEST", 0b0000)
            .instruction("SAMPLE/PRELOAD", 0b0010)
            .instruction("IDCODE", 0b1110)
            .bidir("PA0")
            .input("PB0")
            .build()
            .unwrap()
    }

    #[test]
    fn geometry_from_descriptors() {
        let d = Arc::new(arm("a"));
        let chain = Chain::from_descriptors(vec![d.clone(), d]);
        assert_eq!(chain.ir_len(), Some(8));
        assert_eq!(chain.dr_len(), 6);
        assert_eq!(chain.devices()[1].dr_offset, 3);
        assert_eq!(chain.devices()[1].ir_offset, Some(4));
    }

    #[test]
    fn stream_visits_tdo_end_first() {
        let d = Arc::new(arm("a"));
        let chain = Chain::from_descriptors(vec![d.clone(), d]);
        let mut image = RegisterImage::new(6);
        image.set(0, true); // device 0, cell 0
        let stream = chain.to_stream(Register::Data, &image).unwrap();
        assert_eq!(stream, vec![false, false, false, true, false, false]);
        assert_eq!(chain.from_stream(Register::Data, &stream).unwrap(), image);
    }

    #[test]
    fn discover_two_devices() {
        let desc = arm("cortex");
        let mut sim = SimCable::new()
            .with_device(SimDevice::from_descriptor(&desc, 0x3BA00477))
            .with_device(SimDevice::from_descriptor(&desc, 0x0BA00477));
        let repo = Descriptors::new().with(desc);
        let mut sm = JtagSM::new(&mut sim);
        let chain = discover(&mut sm, &repo, &DiscoveryConfig::default().expect(2)).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.devices()[0].idcode, Some(IdCode(0x3BA00477)));
        assert_eq!(chain.devices()[1].idcode, Some(IdCode(0x0BA00477)));
        assert!(chain.devices()[0].dr_offset < chain.devices()[1].dr_offset);
        assert!(chain.devices()[0].ir_offset < chain.devices()[1].ir_offset);
        assert_eq!(chain.ir_len(), Some(8));
    }

    #[test]
    fn single_unknown_ir_is_inferred() {
        let desc = arm("cortex");
        let mut sim = SimCable::new()
            .with_device(SimDevice::opaque(Some(0x1234_5679), 6))
            .with_device(SimDevice::from_descriptor(&desc, 0x0BA00477));
        let repo = Descriptors::new().with(desc);
        let mut sm = JtagSM::new(&mut sim);
        let chain = discover(&mut sm, &repo, &DiscoveryConfig::default()).unwrap();
        assert!(!chain.devices()[0].is_resolved());
        assert_eq!(chain.devices()[0].ir_len, Some(6));
        assert_eq!(chain.devices()[0].dr_len, 1);
        assert_eq!(chain.dr_len(), 1 + 3);
    }

    #[test]
    fn split_capture_walks_from_tdo() {
        // position 1 (TDO end) known 4 bits, position 0 unknown
        let capture = [true, false, false, false, true, false, false];
        assert_eq!(split_capture(&[None, Some(4)], &capture), Some(vec![3, 4]));
        assert_eq!(split_capture(&[None, None], &capture), Some(vec![3, 4]));
        assert_eq!(split_capture(&[None, None], &[true, false, false]), None);
    }

    #[test]
    fn split_capture_refuses_to_guess() {
        // 4 bits `1000` then 6 bits `100010`: a 4/6 split and an 8/2 split both fit
        let capture = [true, false, false, false, true, false, false, false, true, false];
        assert_eq!(split_capture(&[None, None], &capture), None);
        // knowing the far device settles it
        assert_eq!(split_capture(&[Some(6), None], &capture), Some(vec![6, 4]));
    }

    #[test]
    fn known_devices_keep_geometry_past_unknown_ones() {
        let d = Arc::new(arm("a"));
        let entries = vec![
            (None, None, None),
            (None, None, None),
            (Some(IdCode(d.idcode())), Some(d.clone()), Some(4)),
        ];
        let chain = Chain::build(entries, Some(14));
        assert_eq!(chain.ir_len(), Some(14));
        assert_eq!(chain.devices()[2].ir_offset, Some(10));
        assert_eq!(chain.devices()[2].dr_len, 3);
        assert!(chain.devices()[0].boundary().is_err());

        // the two unplaced registers are shifted as one gap, after the known device
        let mut ir = RegisterImage::new(14);
        ir.set_word(10, 4, 0b0110);
        let stream = chain.to_stream(Register::Instruction, &ir).unwrap();
        assert_eq!(&stream[..4], &[false, true, true, false]);
        assert!(stream[4..].iter().all(|b| !*b));
        assert_eq!(chain.from_stream(Register::Instruction, &stream).unwrap(), ir);
    }
}
