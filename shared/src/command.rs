/*!
Command packet encoding for the instrument firmware.

Every bulk command starts with a one-byte opcode followed by a `0x00` pad
byte and an opcode-specific payload. The layout of each packet is fixed by
its opcode; nothing here is variable-length and nothing here does I/O.
*/

use bytes::BufMut;

use crate::settings::{TriggerLevel, TriggerSlope};

/// Opcode values understood by the firmware
pub mod opcode {
    pub const CALIBRATION_CH0: u8 = 0x00;
    pub const CALIBRATION_CH1: u8 = 0x01;
    pub const CALIBRATION_CH2: u8 = 0x02;
    pub const ARM: u8 = 0x03;
    pub const CALIBRATION_CH3: u8 = 0x04;
    pub const REQUEST_CAPTURE: u8 = 0x05;
    pub const STATUS_POLL: u8 = 0x06;
    pub const TRIGGER_LEVEL: u8 = 0x07;
    pub const FRONT_END: u8 = 0x08;
    pub const COUNTER_ENABLE: u8 = 0x0b;
    pub const VERSION_QUERY: u8 = 0x0c;
    pub const READ_TRIGGER_STATUS: u8 = 0x0d;
    pub const TRIGGER_POSITION: u8 = 0x0e;
    pub const TIMEBASE: u8 = 0x0f;
    pub const TRIGGER_X_POSITION: u8 = 0x10;
    pub const TRIGGER_SLOPE: u8 = 0x11;
    pub const TRIGGER_SOURCE: u8 = 0x12;
    pub const CHANNEL_OFFSETS: u8 = 0x1e;
}

/// ADC bring-up subcommands, issued once by the initialize sequence
pub const ADC_BRINGUP: [[u8; 6]; 5] = [
    [0x00, 0x77, 0x47, 0x12, 0x04, 0x00],
    [0x00, 0x03, 0x00, 0x33, 0x04, 0x00],
    [0x00, 0x65, 0x00, 0x30, 0x02, 0x00],
    [0x00, 0x28, 0xf1, 0x0f, 0x02, 0x00],
    [0x00, 0x12, 0x38, 0x01, 0x02, 0x00],
];

/// Timebase function select (PCB revision dependent, 0x3f = 4 ns)
pub const TIMEBASE_FUNCTION: [u8; 6] = [0x00, 0x3f, 0x00, 0x55, 0x04, 0x00];

/// Per-channel front-end setup block, written before and after the relays settle
pub const CHANNEL_SETUP: [[u8; 6]; 5] = [
    [0x00, 0x10, 0x08, 0x3a, 0x04, 0x00],
    [0x00, 0x04, 0x02, 0x3b, 0x04, 0x00],
    [0x00, 0x00, 0x00, 0x0f, 0x04, 0x00],
    [0x00, 0x04, 0x02, 0x31, 0x04, 0x00],
    [0x00, 0x50, 0x55, 0x2a, 0x04, 0x00],
];

/// Front-end relay preset and commit subcommands
pub const RELAY_PRESET: [u8; 6] = [0x36, 0x36, 0x36, 0x36, 0x01, 0x00];
pub const RELAY_COMMIT: [u8; 6] = [0x06, 0x06, 0x06, 0x06, 0x01, 0x01];

/// Factory calibration constants for the four channels
pub const DEFAULT_CALIBRATION: [(CalibrationRegister, [u8; 2]); 4] = [
    (CalibrationRegister::Ch0, [0x01, 0x62]),
    (CalibrationRegister::Ch1, [0x64, 0x70]),
    (CalibrationRegister::Ch2, [0x80, 0x69]),
    (CalibrationRegister::Ch3, [0xd9, 0x72]),
];

/// Pre/post trigger X-positions for a 4-channel, 200 us window
pub const DEFAULT_TRIGGER_X_POSITION: (u64, u64) = (0x0003_472c, 0x0003_2320);

/// Trigger source / channel enable mask
pub const DEFAULT_TRIGGER_SOURCE: u8 = 0x3d;

/// Vertical offset register value for a centered channel
pub const DEFAULT_CHANNEL_OFFSET: u16 = 0x0400;

/// Frequency-meter reference and mode (counter enabled, 1:3)
pub const COUNTER_REFERENCE_HZ: u32 = 100_000_000;
pub const COUNTER_MODE: u8 = 0x03;

/// Calibration registers; the fourth channel lives at register 4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CalibrationRegister {
    Ch0 = opcode::CALIBRATION_CH0,
    Ch1 = opcode::CALIBRATION_CH1,
    Ch2 = opcode::CALIBRATION_CH2,
    Ch3 = opcode::CALIBRATION_CH3,
}

/// One hardware operation and its parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Per-channel calibration write
    Calibration { register: CalibrationRegister, value: [u8; 2] },
    /// Arm the capture engine
    Arm,
    /// Request `packets` 512-byte USB packets of waveform data (0 = maximum)
    RequestCapture { packets: u8 },
    StatusPoll,
    TriggerLevel(TriggerLevel),
    /// ADC / front-end subcommand with a fixed 6-byte body
    FrontEnd([u8; 6]),
    CounterEnable { reference_hz: u32, mode: u8 },
    VersionQuery,
    ReadTriggerStatus,
    TriggerPosition(u16),
    Timebase(u32),
    /// Two 48-bit trigger X-positions
    TriggerXPosition { pre: u64, post: u64 },
    TriggerSlope(TriggerSlope),
    TriggerSource { mask: u8 },
    ChannelOffsets([u16; 4]),
}

impl Command {
    /// The opcode byte this command is sent with
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Calibration { register, .. } => *register as u8,
            Self::Arm => opcode::ARM,
            Self::RequestCapture { .. } => opcode::REQUEST_CAPTURE,
            Self::StatusPoll => opcode::STATUS_POLL,
            Self::TriggerLevel(_) => opcode::TRIGGER_LEVEL,
            Self::FrontEnd(_) => opcode::FRONT_END,
            Self::CounterEnable { .. } => opcode::COUNTER_ENABLE,
            Self::VersionQuery => opcode::VERSION_QUERY,
            Self::ReadTriggerStatus => opcode::READ_TRIGGER_STATUS,
            Self::TriggerPosition(_) => opcode::TRIGGER_POSITION,
            Self::Timebase(_) => opcode::TIMEBASE,
            Self::TriggerXPosition { .. } => opcode::TRIGGER_X_POSITION,
            Self::TriggerSlope(_) => opcode::TRIGGER_SLOPE,
            Self::TriggerSource { .. } => opcode::TRIGGER_SOURCE,
            Self::ChannelOffsets(_) => opcode::CHANNEL_OFFSETS,
        }
    }

    /// Total packet length, opcode and pad byte included
    pub fn packet_len(&self) -> usize {
        2 + match self {
            Self::Calibration { .. } | Self::Arm | Self::TriggerPosition(_) => 2,
            Self::RequestCapture { .. } => 2,
            Self::StatusPoll | Self::VersionQuery | Self::ReadTriggerStatus => 0,
            Self::TriggerLevel(_) | Self::ChannelOffsets(_) => 24,
            Self::FrontEnd(_) | Self::CounterEnable { .. } => 6,
            Self::Timebase(_) | Self::TriggerSlope(_) | Self::TriggerSource { .. } => 4,
            Self::TriggerXPosition { .. } => 12,
        }
    }

    /// Encode the command into the byte packet written to the bulk OUT endpoint
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.packet_len());
        buf.put_u8(self.opcode());
        buf.put_u8(0x00);

        match *self {
            Self::Calibration { value, .. } => buf.put_slice(&value),
            Self::Arm => buf.put_slice(&[0x01, 0x00]),
            Self::RequestCapture { packets } => {
                buf.put_u8(0x00);
                buf.put_u8(packets);
            }
            Self::StatusPoll | Self::VersionQuery | Self::ReadTriggerStatus => {}
            Self::TriggerLevel(level) => {
                // four channels of `hi hi lo lo`, then the level eight times
                for _ in 0..4 {
                    buf.put_slice(&[level.hi, level.hi, level.lo, level.lo]);
                }
                buf.put_bytes(level.level, 8);
            }
            Self::FrontEnd(body) => buf.put_slice(&body),
            Self::CounterEnable { reference_hz, mode } => {
                buf.put_u32_le(reference_hz);
                buf.put_u8(mode);
                buf.put_u8(0x00);
            }
            Self::TriggerPosition(position) => buf.put_u16_le(position),
            Self::Timebase(raw) => buf.put_u32_le(raw),
            Self::TriggerXPosition { pre, post } => {
                for value in [pre, post] {
                    buf.put_u32_le(value as u32);
                    buf.put_u16_le((value >> 32) as u16);
                }
            }
            Self::TriggerSlope(slope) => {
                buf.put_u8(0x00);
                buf.put_u8(slope.flag());
                buf.put_slice(&[0x01, 0x00]);
            }
            Self::TriggerSource { mask } => {
                buf.put_u8(mask);
                buf.put_bytes(0x00, 3);
            }
            Self::ChannelOffsets(offsets) => {
                for offset in offsets {
                    buf.put_u16_le(offset);
                }
                buf.put_bytes(0x00, 16);
            }
        }

        debug_assert_eq!(buf.len(), self.packet_len());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_packets() {
        let packets: Vec<Vec<u8>> = DEFAULT_CALIBRATION
            .iter()
            .map(|&(register, value)| Command::Calibration { register, value }.encode())
            .collect();

        assert_eq!(packets[0], [0x00, 0x00, 0x01, 0x62]);
        assert_eq!(packets[1], [0x01, 0x00, 0x64, 0x70]);
        assert_eq!(packets[2], [0x02, 0x00, 0x80, 0x69]);
        assert_eq!(packets[3], [0x04, 0x00, 0xd9, 0x72]);
    }

    #[test]
    fn test_fixed_packets() {
        assert_eq!(Command::Arm.encode(), [0x03, 0x00, 0x01, 0x00]);
        assert_eq!(Command::StatusPoll.encode(), [0x06, 0x00]);
        assert_eq!(Command::VersionQuery.encode(), [0x0c, 0x00]);
        assert_eq!(Command::ReadTriggerStatus.encode(), [0x0d, 0x00]);
    }

    #[test]
    fn test_request_capture() {
        assert_eq!(Command::RequestCapture { packets: 8 }.encode(), [0x05, 0x00, 0x00, 0x08]);
        assert_eq!(Command::RequestCapture { packets: 128 }.encode(), [0x05, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_trigger_level_pattern() {
        let level = TriggerLevel { hi: 0x76, lo: 0x6e, level: 0x72 };
        let expected = [
            0x07, 0x00, 0x76, 0x76, 0x6e, 0x6e, 0x76, 0x76, 0x6e, 0x6e, 0x76, 0x76, 0x6e, 0x6e,
            0x76, 0x76, 0x6e, 0x6e, 0x72, 0x72, 0x72, 0x72, 0x72, 0x72, 0x72, 0x72,
        ];
        assert_eq!(Command::TriggerLevel(level).encode(), expected);
    }

    #[test]
    fn test_front_end_packets() {
        assert_eq!(
            Command::FrontEnd(ADC_BRINGUP[0]).encode(),
            [0x08, 0x00, 0x00, 0x77, 0x47, 0x12, 0x04, 0x00]
        );
        assert_eq!(
            Command::FrontEnd(RELAY_COMMIT).encode(),
            [0x08, 0x00, 0x06, 0x06, 0x06, 0x06, 0x01, 0x01]
        );
    }

    #[test]
    fn test_counter_enable() {
        let command = Command::CounterEnable {
            reference_hz: COUNTER_REFERENCE_HZ,
            mode: COUNTER_MODE,
        };
        assert_eq!(command.encode(), [0x0b, 0x00, 0x00, 0xe1, 0xf5, 0x05, 0x03, 0x00]);
    }

    #[test]
    fn test_trigger_position_and_timebase() {
        assert_eq!(Command::TriggerPosition(0).encode(), [0x0e, 0x00, 0x00, 0x00]);
        assert_eq!(Command::TriggerPosition(0x1234).encode(), [0x0e, 0x00, 0x34, 0x12]);
        assert_eq!(Command::Timebase(99).encode(), [0x0f, 0x00, 0x63, 0x00, 0x00, 0x00]);
        assert_eq!(Command::Timebase(1_250_000).encode(), [0x0f, 0x00, 0xd0, 0x12, 0x13, 0x00]);
    }

    #[test]
    fn test_trigger_x_position() {
        let (pre, post) = DEFAULT_TRIGGER_X_POSITION;
        let expected = [
            0x10, 0x00, 0x2c, 0x47, 0x03, 0x00, 0x00, 0x00, 0x20, 0x23, 0x03, 0x00, 0x00, 0x00,
        ];
        assert_eq!(Command::TriggerXPosition { pre, post }.encode(), expected);

        let wide = Command::TriggerXPosition { pre: 0x0102_0304_0506, post: 0 }.encode();
        assert_eq!(&wide[2..8], &[0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_trigger_slope_and_source() {
        assert_eq!(
            Command::TriggerSlope(TriggerSlope::Rising).encode(),
            [0x11, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
        assert_eq!(
            Command::TriggerSlope(TriggerSlope::Falling).encode(),
            [0x11, 0x00, 0x00, 0x01, 0x01, 0x00]
        );
        assert_eq!(
            Command::TriggerSource { mask: DEFAULT_TRIGGER_SOURCE }.encode(),
            [0x12, 0x00, 0x3d, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_channel_offsets() {
        let packet = Command::ChannelOffsets([DEFAULT_CHANNEL_OFFSET; 4]).encode();
        let mut expected = vec![0x1e, 0x00, 0x00, 0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x04];
        expected.extend_from_slice(&[0u8; 16]);
        assert_eq!(packet, expected);
    }
}
