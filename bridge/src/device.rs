/*!
USB link to the instrument.

[`DeviceLink`] is the only way the acquisition controller talks to hardware.
[`UsbLink`] drives a real instrument through libusb; [`SimulatedLink`] stands
in for one, answering status reads and serving synthetic capture data.
*/

use std::f64::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext};
use shared::command::opcode;
use shared::protocol::{self, request};
use shared::TransportError;
use tracing::{debug, info, trace};

/// Data stage of a control transfer
#[derive(Debug, Clone, Copy)]
pub enum ControlData<'a> {
    /// Host-to-device payload
    Out(&'a [u8]),
    /// Device-to-host transfer of up to this many bytes
    In(usize),
}

/// Exclusive duplex channel to the instrument
pub trait DeviceLink: Send {
    /// Issue a control transfer. Returns the bytes read for IN transfers and
    /// an empty vector for OUT transfers.
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: ControlData<'_>,
    ) -> Result<Vec<u8>, TransportError>;

    /// Write a command packet to a bulk OUT endpoint
    fn bulk_write(&mut self, endpoint: u8, data: &[u8]) -> Result<(), TransportError>;

    /// Read up to `max_len` bytes from a bulk IN endpoint
    fn bulk_read(&mut self, endpoint: u8, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

fn map_usb_error(error: rusb::Error) -> TransportError {
    match error {
        rusb::Error::Pipe => TransportError::Pipe,
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::NoDevice => TransportError::Disconnected,
        other => TransportError::Other(other.to_string()),
    }
}

/// libusb-backed link to a physical instrument
pub struct UsbLink {
    handle: DeviceHandle<GlobalContext>,
    timeout: Duration,
}

impl UsbLink {
    const INTERFACE: u8 = 0;

    /// Open the first device matching `vendor_id:product_id` and claim its interface
    pub fn open(vendor_id: u16, product_id: u16, timeout: Duration) -> Result<Self, TransportError> {
        info!("🔍 Searching for instrument {:04x}:{:04x}", vendor_id, product_id);
        let handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or_else(|| {
            TransportError::Other(format!("device {:04x}:{:04x} not found", vendor_id, product_id))
        })?;

        let device = handle.device();
        info!(
            "✅ Found instrument on bus {} address {}",
            device.bus_number(),
            device.address()
        );

        // Not supported on every platform
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.set_active_configuration(1).map_err(map_usb_error)?;
        handle.claim_interface(Self::INTERFACE).map_err(map_usb_error)?;
        handle
            .set_alternate_setting(Self::INTERFACE, 0)
            .map_err(map_usb_error)?;

        Ok(Self { handle, timeout })
    }
}

impl DeviceLink for UsbLink {
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: ControlData<'_>,
    ) -> Result<Vec<u8>, TransportError> {
        match data {
            ControlData::Out(payload) => {
                self.handle
                    .write_control(request_type, request, value, index, payload, self.timeout)
                    .map_err(map_usb_error)?;
                Ok(Vec::new())
            }
            ControlData::In(length) => {
                let mut buf = vec![0u8; length];
                let read = self
                    .handle
                    .read_control(request_type, request, value, index, &mut buf, self.timeout)
                    .map_err(map_usb_error)?;
                buf.truncate(read);
                Ok(buf)
            }
        }
    }

    fn bulk_write(&mut self, endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
        let written = self
            .handle
            .write_bulk(endpoint, data, self.timeout)
            .map_err(map_usb_error)?;
        if written != data.len() {
            return Err(TransportError::Other(format!(
                "short bulk write: {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    }

    fn bulk_read(&mut self, endpoint: u8, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max_len];
        let read = self
            .handle
            .read_bulk(endpoint, &mut buf, timeout)
            .map_err(map_usb_error)?;
        buf.truncate(read);
        Ok(buf)
    }
}

impl Drop for UsbLink {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(Self::INTERFACE);
    }
}

/// One transfer seen by a [`SimulatedLink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        out: Option<Vec<u8>>,
    },
    BulkWrite(Vec<u8>),
    BulkRead { requested: usize, returned: usize },
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control {
                request_type,
                request,
                value,
                index,
                out,
            } => write!(
                f,
                "control {:#04x}/{} value={:#06x} index={} out={}",
                request_type,
                request,
                value,
                index,
                out.as_deref().map(hex::encode).unwrap_or_else(|| "-".to_string())
            ),
            Self::BulkWrite(packet) => write!(f, "bulk write {}", hex::encode(packet)),
            Self::BulkRead { requested, returned } => {
                write!(f, "bulk read {} of {} bytes", returned, requested)
            }
        }
    }
}

#[derive(Debug)]
struct SimState {
    pattern: Vec<u8>,
    cursor: usize,
    reply: Option<Vec<u8>>,
    trigger_status: [u8; 6],
    stall_calibration_clear: bool,
    capture_limit: Option<usize>,
    fail_transfers: bool,
    #[cfg(test)]
    log: Vec<Transfer>,
}

/// In-memory instrument. Clones share state, so a test can keep one clone to
/// inspect the transfer log while the controller owns another.
#[derive(Debug, Clone)]
pub struct SimulatedLink {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedLink {
    const FPGA_VERSION: [u8; 4] = [0x12, 0x05, 0x20, 0x20];
    const EEPROM_TEXT: &'static [u8] = b"HANTEK6254BD-SIM";

    /// Instrument serving capture data from `pattern`, repeated as needed
    pub fn with_pattern(pattern: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                pattern,
                cursor: 0,
                reply: None,
                trigger_status: [0, 0, 0x00, 0x10, 0x03, 0],
                stall_calibration_clear: true,
                capture_limit: None,
                fail_transfers: false,
                #[cfg(test)]
                log: Vec::new(),
            })),
        }
    }

    /// Instrument producing a phase-shifted sine on each of the four channels
    pub fn synthetic() -> Self {
        let samples = protocol::MAX_CAPTURE_BYTES / shared::CHANNEL_COUNT;
        let mut pattern = Vec::with_capacity(protocol::MAX_CAPTURE_BYTES);
        for k in 0..samples {
            for channel in 0..shared::CHANNEL_COUNT {
                let phase = 2.0 * PI * k as f64 / 256.0 + channel as f64 * PI / 2.0;
                pattern.push((128.0 + 96.0 * phase.sin()).round() as u8);
            }
        }
        debug!("🧪 Synthetic instrument with {} byte pattern", pattern.len());
        Self::with_pattern(pattern)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return at most `limit` bytes for capture reads
    #[cfg(test)]
    pub fn set_capture_limit(&self, limit: Option<usize>) {
        self.state().capture_limit = limit;
    }

    /// Make every following transfer fail as if the device vanished
    #[cfg(test)]
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state().fail_transfers = disconnected;
    }

    /// Whether the calibration-clear request stalls like the real hardware
    #[cfg(test)]
    pub fn set_stall_calibration_clear(&self, stall: bool) {
        self.state().stall_calibration_clear = stall;
    }

    /// Everything the link has seen so far
    #[cfg(test)]
    pub fn log(&self) -> Vec<Transfer> {
        self.state().log.clone()
    }

    /// Bulk command packets written so far
    #[cfg(test)]
    pub fn written_packets(&self) -> Vec<Vec<u8>> {
        self.state()
            .log
            .iter()
            .filter_map(|transfer| match transfer {
                Transfer::BulkWrite(packet) => Some(packet.clone()),
                _ => None,
            })
            .collect()
    }

    #[cfg(test)]
    pub fn clear_log(&self) {
        self.state().log.clear();
    }
}

impl SimState {
    fn record(&mut self, transfer: Transfer) {
        trace!("🧪 {}", transfer);
        #[cfg(test)]
        self.log.push(transfer);
    }

    fn next_capture(&mut self, length: usize) -> Vec<u8> {
        if self.pattern.is_empty() {
            return vec![0x80; length];
        }
        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            data.push(self.pattern[self.cursor]);
            self.cursor = (self.cursor + 1) % self.pattern.len();
        }
        if let Some(limit) = self.capture_limit {
            data.truncate(limit);
        }
        data
    }
}

impl DeviceLink for SimulatedLink {
    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: ControlData<'_>,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        state.record(Transfer::Control {
            request_type,
            request,
            value,
            index,
            out: match data {
                ControlData::Out(payload) => Some(payload.to_vec()),
                ControlData::In(_) => None,
            },
        });
        if state.fail_transfers {
            return Err(TransportError::Disconnected);
        }

        match (request, data) {
            (request::CLEAR_CALIBRATION, ControlData::Out(_)) if state.stall_calibration_clear => {
                Err(TransportError::Pipe)
            }
            (_, ControlData::Out(_)) => Ok(Vec::new()),
            (request::PING, ControlData::In(length)) => {
                // first byte non-zero: enumerated at high speed
                let mut reply = vec![0u8; length];
                if let Some(first) = reply.first_mut() {
                    *first = 1;
                }
                Ok(reply)
            }
            (request::READ_EEPROM, ControlData::In(length)) => {
                let mut reply = Self::EEPROM_TEXT.to_vec();
                reply.resize(length, 0);
                Ok(reply)
            }
            (_, ControlData::In(length)) => Ok(vec![0u8; length]),
        }
    }

    fn bulk_write(&mut self, _endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        state.record(Transfer::BulkWrite(data.to_vec()));
        if state.fail_transfers {
            return Err(TransportError::Disconnected);
        }

        let reply = match data.first().copied() {
            Some(opcode::VERSION_QUERY) => {
                let mut reply = Self::FPGA_VERSION.to_vec();
                reply.resize(protocol::USB_PACKET_SIZE, 0);
                Some(reply)
            }
            Some(opcode::STATUS_POLL) => Some(vec![0u8; protocol::USB_PACKET_SIZE]),
            Some(opcode::READ_TRIGGER_STATUS) => {
                let mut reply = state.trigger_status.to_vec();
                reply.resize(protocol::USB_PACKET_SIZE, 0);
                Some(reply)
            }
            Some(opcode::REQUEST_CAPTURE) => {
                let packets = data.get(3).copied().unwrap_or(0);
                Some(state.next_capture(protocol::capture_len(packets)))
            }
            _ => None,
        };
        if let Some(reply) = reply {
            state.reply = Some(reply);
        }
        Ok(())
    }

    fn bulk_read(&mut self, _endpoint: u8, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        if state.fail_transfers {
            state.record(Transfer::BulkRead { requested: max_len, returned: 0 });
            return Err(TransportError::Disconnected);
        }

        let result = match state.reply.take() {
            Some(mut reply) => {
                reply.truncate(max_len);
                Ok(reply)
            }
            None => Err(TransportError::Timeout),
        };
        let returned = result.as_ref().map(Vec::len).unwrap_or(0);
        state.record(Transfer::BulkRead { requested: max_len, returned });
        result
    }
}
