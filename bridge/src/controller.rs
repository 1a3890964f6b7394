/*!
Acquisition controller.

Owns the device link and the acquisition settings. Settings changes are only
recorded here; they reach the instrument at the start of the next capture,
under the same lock the capture runs under, so a capture never sees a
half-applied configuration.
*/

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use shared::command::{
    self, ADC_BRINGUP, CHANNEL_SETUP, DEFAULT_CALIBRATION, DEFAULT_CHANNEL_OFFSET,
    DEFAULT_TRIGGER_SOURCE, DEFAULT_TRIGGER_X_POSITION, RELAY_COMMIT, RELAY_PRESET,
    TIMEBASE_FUNCTION,
};
use shared::protocol::{self, request};
use shared::{
    CalibrationPolicy, ChannelWaveform, Command, DeviceSettings, Result, ScopeError,
    TransportError, TriggerStatus, WaveformCodec, WaveformFrame, CHANNEL_COUNT,
};
use tracing::{debug, info, trace, warn};

use crate::device::{ControlData, DeviceLink};

/// Delays after each ADC bring-up step but the last
const BRINGUP_DELAYS: [Duration; 4] = [
    Duration::from_millis(2),
    Duration::from_millis(2),
    Duration::from_millis(2),
    Duration::from_millis(15),
];

/// Front-end relay settle times
const RELAY_PRESET_SETTLE: Duration = Duration::from_millis(4);
const RELAY_COMMIT_SETTLE: Duration = Duration::from_millis(50);

/// Trigger position written before every capture
const TRIGGER_POSITION: u16 = 0;

/// Lifecycle of the instrument as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Initialized,
    Configured,
    Armed,
    Capturing,
    Ready,
}

/// Tunables that do not change while the bridge runs
#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    /// 512-byte packets requested per capture (0 = maximum)
    pub capture_packets: u8,
    pub bulk_timeout: Duration,
    pub calibration: CalibrationPolicy,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            capture_packets: protocol::DEFAULT_CAPTURE_PACKETS,
            bulk_timeout: Duration::from_millis(protocol::DEFAULT_BULK_TIMEOUT_MS),
            calibration: CalibrationPolicy::default(),
        }
    }
}

/// One acquisition and the settings it was taken with
#[derive(Debug, Clone)]
pub struct Capture {
    pub settings: DeviceSettings,
    pub channels: [ChannelWaveform; CHANNEL_COUNT],
}

impl Capture {
    /// Waveform frame for streaming clients
    pub fn to_frame(&self) -> WaveformFrame {
        WaveformFrame::new(self.settings.femtoseconds_per_sample(), self.channels.to_vec())
    }
}

struct Inner {
    link: Box<dyn DeviceLink>,
    settings: DeviceSettings,
    dirty: bool,
    state: ControllerState,
    bulk_timeout: Duration,
}

impl Inner {
    /// Control transfer where an endpoint stall means "done, no data"
    fn control_allow_stall(&mut self, request_type: u8, request: u8, data: ControlData<'_>) -> Result<Vec<u8>> {
        match self.link.control_transfer(request_type, request, 0, 0, data) {
            Err(error) if error.is_ignorable_stall() => {
                debug!("Ignoring stall on control request {}", request);
                Ok(Vec::new())
            }
            other => Ok(other?),
        }
    }

    fn control_in(&mut self, request: u8, value: u16, length: usize) -> Result<Vec<u8>> {
        Ok(self.link.control_transfer(
            request::TYPE_VENDOR_IN,
            request,
            value,
            0,
            ControlData::In(length),
        )?)
    }

    fn ping(&mut self) -> Result<Vec<u8>> {
        self.control_in(request::PING, 0, request::PING_REPLY_LEN)
    }

    /// Handshake the firmware expects before every bulk command
    fn reset(&mut self) -> Result<()> {
        self.control_allow_stall(
            request::TYPE_VENDOR_OUT,
            request::RESET,
            ControlData::Out(&request::RESET_PAYLOAD),
        )?;
        self.control_allow_stall(
            request::TYPE_VENDOR_IN,
            request::PING,
            ControlData::In(request::PING_REPLY_LEN),
        )?;
        Ok(())
    }

    fn send(&mut self, command: Command) -> Result<()> {
        self.reset()?;
        let packet = command.encode();
        trace!("→ {}", hex::encode(&packet));
        self.link.bulk_write(protocol::ENDPOINT_OUT, &packet)?;
        Ok(())
    }

    fn send_front_end(&mut self, bodies: &[[u8; 6]]) -> Result<()> {
        for body in bodies {
            self.send(Command::FrontEnd(*body))?;
        }
        Ok(())
    }

    fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        let data = self.link.bulk_read(protocol::ENDPOINT_IN, length, self.bulk_timeout)?;
        trace!("← {} bytes", data.len());
        Ok(data)
    }

    /// Bulk reply size: 512 at high speed, 64 at full speed
    fn reply_len(&mut self) -> Result<usize> {
        let status = self.ping()?;
        Ok(match status.first() {
            Some(&speed) if speed > 0 => protocol::USB_PACKET_SIZE,
            _ => protocol::FULL_SPEED_PACKET_SIZE,
        })
    }

    fn bring_up(&mut self) -> Result<()> {
        self.control_allow_stall(
            request::TYPE_VENDOR_OUT,
            request::CLEAR_CALIBRATION,
            ControlData::Out(&[0u8; 10]),
        )?;

        for _ in 0..3 {
            self.send(Command::VersionQuery)?;
        }
        let reply_len = self.reply_len()?;
        let fpga = self.read(reply_len)?;
        debug!("FPGA version block: {}", hex::encode(&fpga[..fpga.len().min(8)]));

        let version = self.control_in(request::READ_EEPROM, request::VERSION_ADDRESS, request::VERSION_LEN)?;
        info!("📟 Instrument version: {}", printable(&version));

        self.reset()?;
        let driver = self.control_in(
            request::READ_EEPROM,
            request::DRIVER_VERSION_ADDRESS,
            request::DRIVER_VERSION_LEN,
        )?;
        debug!("Driver version block: {}", hex::encode(&driver));

        for (step, body) in ADC_BRINGUP.iter().enumerate() {
            self.send(Command::FrontEnd(*body))?;
            if let Some(delay) = BRINGUP_DELAYS.get(step) {
                thread::sleep(*delay);
            }
        }
        Ok(())
    }

    /// Full register write sequence for `settings`
    fn apply_configuration(&mut self, settings: &DeviceSettings) -> Result<()> {
        let (pre, post) = DEFAULT_TRIGGER_X_POSITION;

        self.send(Command::CounterEnable {
            reference_hz: command::COUNTER_REFERENCE_HZ,
            mode: command::COUNTER_MODE,
        })?;
        self.send(Command::FrontEnd(TIMEBASE_FUNCTION))?;
        self.send(Command::TriggerXPosition { pre, post })?;
        self.send_front_end(&CHANNEL_SETUP)?;
        self.send(Command::Timebase(settings.timebase_raw()))?;
        self.send(Command::TriggerXPosition { pre, post })?;

        self.send(Command::FrontEnd(RELAY_PRESET))?;
        thread::sleep(RELAY_PRESET_SETTLE);
        self.send(Command::FrontEnd(RELAY_COMMIT))?;
        thread::sleep(RELAY_COMMIT_SETTLE);
        self.send_front_end(&CHANNEL_SETUP)?;

        self.send(Command::TriggerSource { mask: DEFAULT_TRIGGER_SOURCE })?;
        for (register, value) in DEFAULT_CALIBRATION {
            self.send(Command::Calibration { register, value })?;
        }
        self.send(Command::ChannelOffsets([DEFAULT_CHANNEL_OFFSET; CHANNEL_COUNT]))?;
        self.send(Command::TriggerLevel(settings.trigger_level()))?;
        self.send(Command::TriggerSlope(settings.trigger_slope))?;
        Ok(())
    }

    /// Arm, wait for the trigger and read one capture buffer
    fn capture_cycle(&mut self, packets: u8) -> Result<Vec<u8>> {
        self.state = ControllerState::Armed;
        self.send(Command::Arm)?;

        // both polls are required, their replies are not
        for _ in 0..2 {
            self.send(Command::StatusPoll)?;
            self.read(protocol::USB_PACKET_SIZE)?;
        }

        self.send(Command::ReadTriggerStatus)?;
        let reply = self.read(protocol::USB_PACKET_SIZE)?;
        let status = TriggerStatus::from_reply(&reply)
            .ok_or_else(|| ScopeError::capture(format!("trigger status reply too short ({} bytes)", reply.len())))?;
        trace!(
            "Trigger status trig23={} trig45={} (derived position {}, writing {})",
            status.trig23,
            status.trig45,
            status.derived_position(),
            TRIGGER_POSITION
        );
        self.send(Command::TriggerPosition(TRIGGER_POSITION))?;

        self.state = ControllerState::Capturing;
        let expected = protocol::capture_len(packets);
        self.send(Command::RequestCapture { packets })?;
        self.ping()?;

        let data = self.read(expected)?;
        if data.len() < expected {
            return Err(TransportError::ShortRead {
                expected,
                actual: data.len(),
            }
            .into());
        }
        Ok(data)
    }
}

fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .chars()
        .filter(|c| !c.is_control())
        .collect()
}

/// Single owner of the instrument, shared by the control and stream servers
pub struct AcquisitionController {
    inner: Mutex<Inner>,
    codec: WaveformCodec,
    capture_packets: u8,
}

impl AcquisitionController {
    /// Wrap a link. Settings start at their defaults and are pending until
    /// the first capture.
    pub fn new(link: Box<dyn DeviceLink>, options: ControllerOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                link,
                settings: DeviceSettings::default(),
                dirty: true,
                state: ControllerState::Uninitialized,
                bulk_timeout: options.bulk_timeout,
            }),
            codec: WaveformCodec::new(options.calibration),
            capture_packets: options.capture_packets,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ScopeError::capture("controller lock poisoned by a failed capture"))
    }

    /// Run the bring-up sequence. Later calls are no-ops.
    pub fn initialize(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.state != ControllerState::Uninitialized {
            debug!("Instrument already initialized");
            return Ok(());
        }

        info!("🔌 Initializing instrument");
        inner.bring_up()?;
        inner.state = ControllerState::Initialized;
        info!("✅ Instrument initialized");
        Ok(())
    }

    /// Record new settings; they are written to the device by the next capture
    pub fn configure(&self, settings: DeviceSettings) -> Result<()> {
        settings.validate()?;

        let mut inner = self.lock()?;
        inner.settings = settings;
        inner.dirty = true;
        debug!(
            "Settings pending: {} Hz, trigger {} V {:?}",
            settings.sample_rate_hz, settings.trigger_voltage_v, settings.trigger_slope
        );
        Ok(())
    }

    /// Current settings, applied or pending
    pub fn settings(&self) -> Result<DeviceSettings> {
        Ok(self.lock()?.settings)
    }

    /// Whether settings are waiting to be written to the device
    #[cfg(test)]
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(self.lock()?.dirty)
    }

    #[cfg(test)]
    pub fn state(&self) -> Result<ControllerState> {
        Ok(self.lock()?.state)
    }

    /// Apply pending settings if any, then take one capture
    pub fn acquire(&self) -> Result<Capture> {
        let mut inner = self.lock()?;
        if inner.state == ControllerState::Uninitialized {
            return Err(ScopeError::capture("instrument not initialized"));
        }

        if inner.dirty {
            let settings = inner.settings;
            info!(
                "⚙️ Applying configuration: {} Hz (timebase {}), trigger {} V {:?}",
                settings.sample_rate_hz,
                settings.timebase_raw(),
                settings.trigger_voltage_v,
                settings.trigger_slope
            );
            inner.apply_configuration(&settings)?;
            inner.dirty = false;
            inner.state = ControllerState::Configured;
        }

        let settings = inner.settings;
        let data = match inner.capture_cycle(self.capture_packets) {
            Ok(data) => data,
            Err(error) => {
                warn!("Capture failed: {}", error);
                inner.state = ControllerState::Configured;
                return Err(error);
            }
        };
        inner.state = ControllerState::Ready;
        drop(inner);

        let channels = self.codec.decode(&data)?;
        Ok(Capture { settings, channels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SimulatedLink, Transfer};
    use shared::command::opcode;
    use std::sync::Arc;

    fn simulated(packets: u8) -> (AcquisitionController, SimulatedLink) {
        let link = SimulatedLink::with_pattern(vec![10, 20, 30, 200, 200, 30, 20, 10]);
        let options = ControllerOptions {
            capture_packets: packets,
            ..Default::default()
        };
        let controller = AcquisitionController::new(Box::new(link.clone()), options);
        (controller, link)
    }

    fn opcodes(link: &SimulatedLink) -> Vec<u8> {
        link.written_packets().iter().map(|packet| packet[0]).collect()
    }

    fn timebase_writes(link: &SimulatedLink) -> Vec<Vec<u8>> {
        link.written_packets()
            .into_iter()
            .filter(|packet| packet[0] == opcode::TIMEBASE)
            .collect()
    }

    #[test]
    fn test_initialize_sequence() {
        let (controller, link) = simulated(4);
        controller.initialize().unwrap();
        assert_eq!(controller.state().unwrap(), ControllerState::Initialized);

        let log = link.log();
        // calibration clear stalls on the simulated device and is tolerated
        assert!(matches!(
            &log[0],
            Transfer::Control { request: request::CLEAR_CALIBRATION, .. }
        ));

        let ops = opcodes(&link);
        assert_eq!(&ops[..3], &[opcode::VERSION_QUERY; 3]);
        assert_eq!(&ops[3..], &[opcode::FRONT_END; 5]);
        assert_eq!(link.written_packets()[3], Command::FrontEnd(ADC_BRINGUP[0]).encode());

        // every bulk command is preceded by the reset handshake
        let resets = log
            .iter()
            .filter(|t| matches!(t, Transfer::Control { request: request::RESET, .. }))
            .count();
        assert_eq!(resets, 8 + 1);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (controller, link) = simulated(4);
        controller.initialize().unwrap();
        let writes = link.written_packets().len();
        controller.initialize().unwrap();
        assert_eq!(link.written_packets().len(), writes);
    }

    #[test]
    fn test_initialize_fails_on_transport_error() {
        let (controller, link) = simulated(4);
        link.set_disconnected(true);
        let error = controller.initialize().unwrap_err();
        assert!(matches!(error, ScopeError::Transport(TransportError::Disconnected)));
        assert_eq!(controller.state().unwrap(), ControllerState::Uninitialized);
    }

    #[test]
    fn test_acquire_requires_initialize() {
        let (controller, _link) = simulated(4);
        assert!(matches!(controller.acquire(), Err(ScopeError::Capture(_))));
    }

    #[test]
    fn test_first_acquire_applies_configuration() {
        let (controller, link) = simulated(4);
        controller.initialize().unwrap();
        link.clear_log();

        let capture = controller.acquire().unwrap();
        assert_eq!(controller.state().unwrap(), ControllerState::Ready);
        assert!(!controller.is_dirty().unwrap());
        assert_eq!(capture.channels[0].samples.len(), 512);

        let ops = opcodes(&link);
        let x_positions = ops.iter().filter(|&&op| op == opcode::TRIGGER_X_POSITION).count();
        assert_eq!(x_positions, 2);
        assert_eq!(timebase_writes(&link), vec![Command::Timebase(99).encode()]);

        // configuration ends with level + slope, then the capture cycle
        let cycle = [
            opcode::TRIGGER_LEVEL,
            opcode::TRIGGER_SLOPE,
            opcode::ARM,
            opcode::STATUS_POLL,
            opcode::STATUS_POLL,
            opcode::READ_TRIGGER_STATUS,
            opcode::TRIGGER_POSITION,
            opcode::REQUEST_CAPTURE,
        ];
        assert_eq!(&ops[ops.len() - cycle.len()..], &cycle);
        assert!(link
            .written_packets()
            .contains(&Command::TriggerPosition(0).encode()));
    }

    #[test]
    fn test_configure_rejects_out_of_range_rate() {
        let (controller, _link) = simulated(4);
        controller.initialize().unwrap();
        controller.acquire().unwrap();
        assert!(!controller.is_dirty().unwrap());

        let before = controller.settings().unwrap();
        let rejected = DeviceSettings {
            sample_rate_hz: 300_000_000,
            ..before
        };
        assert!(matches!(
            controller.configure(rejected),
            Err(ScopeError::Configuration(_))
        ));
        assert_eq!(controller.settings().unwrap(), before);
        assert!(!controller.is_dirty().unwrap());
    }

    #[test]
    fn test_configure_applies_once() {
        let (controller, link) = simulated(4);
        controller.initialize().unwrap();
        controller.acquire().unwrap();
        link.clear_log();

        let settings = DeviceSettings {
            sample_rate_hz: 1_000_000,
            ..controller.settings().unwrap()
        };
        controller.configure(settings).unwrap();
        assert!(controller.is_dirty().unwrap());

        let capture = controller.acquire().unwrap();
        assert_eq!(capture.settings.sample_rate_hz, 1_000_000);
        assert_eq!(timebase_writes(&link), vec![Command::Timebase(124).encode()]);

        controller.acquire().unwrap();
        assert_eq!(timebase_writes(&link).len(), 1);
    }

    #[test]
    fn test_concurrent_configure_never_splits_a_capture() {
        let (controller, link) = simulated(4);
        let controller = Arc::new(controller);
        controller.initialize().unwrap();
        controller.acquire().unwrap();
        link.clear_log();

        let configurer = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || {
                for rate in [1_000_000, 2_500_000, 5_000_000] {
                    let settings = DeviceSettings {
                        sample_rate_hz: rate,
                        ..controller.settings().unwrap()
                    };
                    controller.configure(settings).unwrap();
                }
            })
        };
        for _ in 0..3 {
            controller.acquire().unwrap();
        }
        configurer.join().unwrap();

        // a configuration block is always complete before the next arm
        let ops = opcodes(&link);
        for (i, &op) in ops.iter().enumerate() {
            if op == opcode::TIMEBASE {
                let next_arm = ops[i..].iter().position(|&o| o == opcode::ARM);
                let next_slope = ops[i..].iter().position(|&o| o == opcode::TRIGGER_SLOPE);
                assert!(next_slope.unwrap() < next_arm.unwrap_or(usize::MAX));
            }
        }

        // whatever was configured last is applied exactly once more at most
        let final_capture = controller.acquire().unwrap();
        assert_eq!(final_capture.settings.sample_rate_hz, 5_000_000);
        assert!(!controller.is_dirty().unwrap());
        let last = timebase_writes(&link).pop().unwrap();
        assert_eq!(last, Command::Timebase(24).encode());
    }

    #[test]
    fn test_short_read_fails_capture() {
        let (controller, link) = simulated(4);
        controller.initialize().unwrap();
        link.set_capture_limit(Some(1000));

        let error = controller.acquire().unwrap_err();
        assert!(matches!(
            error,
            ScopeError::Transport(TransportError::ShortRead { expected: 2048, actual: 1000 })
        ));

        // the link recovers and the next capture succeeds without reconfiguring
        link.set_capture_limit(None);
        link.clear_log();
        controller.acquire().unwrap();
        assert!(timebase_writes(&link).is_empty());
    }

    #[test]
    fn test_failed_configuration_stays_pending() {
        let (controller, link) = simulated(4);
        controller.initialize().unwrap();
        link.set_disconnected(true);
        assert!(controller.acquire().is_err());
        assert!(controller.is_dirty().unwrap());

        link.set_disconnected(false);
        link.clear_log();
        controller.acquire().unwrap();
        assert_eq!(timebase_writes(&link).len(), 1);
    }

    #[test]
    fn test_capture_frame_uses_capture_rate() {
        let (controller, _link) = simulated(4);
        controller.initialize().unwrap();
        let frame = controller.acquire().unwrap().to_frame();
        assert_eq!(frame.femtoseconds_per_sample, 800_000_000);
        assert_eq!(frame.channels.len(), CHANNEL_COUNT);
    }
}
