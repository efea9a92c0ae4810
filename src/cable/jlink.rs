//! Implement the `Cable` trait for SEGGER J-Link adapters
use std::format;
use std::time::Duration;
use std::vec;
use std::vec::Vec;

use rusb::{DeviceHandle, Direction, GlobalContext};
use rusb::constants::*;
use tracing::debug;

use crate::cable::{check_vectors, pack_bits, unpack_bits, Cable, CableError};

// EMU_CMD_HW_JTAG3 takes at most this many bytes each of TMS and TDI
const MAX_SEQUENCE_BYTES: usize = 384;
const TIMEOUT: Duration = Duration::from_millis(100);
// below this the target is probably unpowered or disconnected
const MIN_VREF_MV: u16 = 1500;

fn usb(e: rusb::Error) -> CableError {
    CableError::Io(format!("usb: {}", e))
}

pub struct JLink {
    device: DeviceHandle<GlobalContext>,
    // queued bytes to send
    buffer: Vec<u8>,
    read_endpoint: u8,
    write_endpoint: u8,
}

impl JLink {
    pub fn new(clock: u32) -> Result<Self, CableError> {
        let device = rusb::open_device_with_vid_pid(0x1366, 0x0105)
            .ok_or_else(|| CableError::NotFound("no jlink attached".into()))?;
        let descriptor = device.device().active_config_descriptor().map_err(usb)?;
        for i in descriptor.interfaces() {
            for d in i.descriptors() {
                if d.class_code() != LIBUSB_CLASS_VENDOR_SPEC ||
                    d.sub_class_code() != LIBUSB_CLASS_VENDOR_SPEC ||
                        d.num_endpoints() < 2 {
                            continue;
                }

                let mut read_endpoint = None;
                let mut write_endpoint = None;
                for e in d.endpoint_descriptors() {
                    match e.direction() {
                        Direction::In => read_endpoint = Some(e.address()),
                        Direction::Out => write_endpoint = Some(e.address()),
                    }
                }

                let (Some(read_endpoint), Some(write_endpoint)) = (read_endpoint, write_endpoint) else {
                    continue;
                };

                // drain anything left over from a previous session
                let mut buf = [0; 2];
                let _ = device.read_bulk(read_endpoint, &mut buf, Duration::from_millis(10));

                let mut jlink = Self {
                    device,
                    buffer: vec![],
                    read_endpoint,
                    write_endpoint,
                };

                jlink.get_status()?;
                jlink.set_clock(clock);
                jlink.set_interface(0)?;
                jlink.deassert_trst();
                jlink.deassert_srst();

                return Ok(jlink);
            }
        }
        Err(CableError::NotFound("jlink has no vendor interface".into()))
    }

    fn send_command(&mut self, cmd: u8, mut data: Vec<u8>) {
        data.insert(0, cmd);
        self.buffer.append(&mut data);
    }

    /// Submit queued commands and read `len` response bytes.
    fn read_data(&mut self, len: usize) -> Result<Vec<u8>, CableError> {
        if !self.buffer.is_empty() {
            let wr = self.device.write_bulk(self.write_endpoint, &self.buffer, TIMEOUT).map_err(usb)?;
            if wr != self.buffer.len() {
                return Err(CableError::Io(format!("usb: wrote {} of {} bytes", wr, self.buffer.len())));
            }
            self.buffer.clear();
        }

        let mut data = vec![];
        while data.len() < len {
            let mut buffer = vec![0; len - data.len()];
            let got = self.device.read_bulk(self.read_endpoint, &mut buffer, TIMEOUT).map_err(usb)?;
            if got == 0 {
                return Err(CableError::ShortRead { expected: len, got: data.len() });
            }
            buffer.truncate(got);
            data.append(&mut buffer);
        }
        Ok(data)
    }

    /// Read the adapter status; fails if the target voltage is too low.
    pub fn get_status(&mut self) -> Result<Vec<u8>, CableError> {
        self.send_command(0x7, vec![]);
        let data = self.read_data(8)?;

        let vref = u16::from_le_bytes([data[0], data[1]]);
        if vref < MIN_VREF_MV {
            return Err(CableError::Io(format!("target voltage {} mV too low", vref)));
        }
        debug!(vref, "jlink status");
        Ok(data)
    }

    pub fn set_clock(&mut self, mut clock: u32) {
        clock /= 1000;
        let buf = vec![(clock & 0xff) as u8, ((clock >> 8) & 0xff) as u8];
        self.send_command(0x5, buf);
    }

    pub fn set_interface(&mut self, intf: u8) -> Result<(), CableError> {
        let buf = vec![intf];
        self.send_command(0xc7, buf);
        self.read_data(4).map(|_| ())
    }

    pub fn assert_srst(&mut self) {
        self.send_command(0xdc, vec![]);
    }

    pub fn deassert_srst(&mut self) {
        self.send_command(0xdd, vec![]);
    }

    pub fn assert_trst(&mut self) {
        self.send_command(0xde, vec![]);
    }

    pub fn deassert_trst(&mut self) {
        self.send_command(0xdf, vec![]);
    }

    fn tap_sequence(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, CableError> {
        let bits = tms.len();
        let mut cmdbuf = vec![(bits & 0xff) as u8, ((bits >> 8) & 0xff) as u8];
        cmdbuf.append(&mut pack_bits(tms));
        cmdbuf.append(&mut pack_bits(tdi));
        self.send_command(0xcd, cmdbuf);

        let data = self.read_data(bits.div_ceil(8))?;
        Ok(unpack_bits(&data, bits))
    }
}

impl Cable for JLink {
    fn shift(&mut self, tms: &[bool], tdi: &[bool]) -> Result<Vec<bool>, CableError> {
        check_vectors(tms, tdi)?;
        let mut tdo = Vec::with_capacity(tms.len());
        let chunk = MAX_SEQUENCE_BYTES * 8;
        for (tms, tdi) in tms.chunks(chunk).zip(tdi.chunks(chunk)) {
            tdo.extend(self.tap_sequence(tms, tdi)?);
        }
        Ok(tdo)
    }

    fn flush(&mut self) -> Result<(), CableError> {
        self.read_data(0).map(|_| ())
    }
}
