/*!
# Shared Types and Utilities

This crate contains the I/O-free parts of the Hantek 6xx4 network bridge:
how hardware operations are encoded, how user settings map onto device
registers, and how captured bytes become calibrated waveforms.

## Core Types

- [`Command`] - One hardware operation and its packet encoding
- [`DeviceSettings`] - Sample rate and trigger settings
- [`WaveformCodec`] - Capture buffer to calibrated channel conversion
- [`WaveformFrame`] - Binary frame sent to streaming clients

## Modules

- [`command`] - Command packet encoding
- [`settings`] - Settings, timebase and trigger-level derivation
- [`waveform`] - Waveform codec and frame format
- [`error`] - Common error types
*/

pub mod command;
pub mod error;
pub mod settings;
pub mod waveform;

// Re-export commonly used types
pub use command::{CalibrationRegister, Command};
pub use error::{Result, ScopeError, TransportError};
pub use settings::{DeviceSettings, TriggerLevel, TriggerSlope, TriggerStatus};
pub use waveform::{CalibrationPolicy, ChannelWaveform, WaveformCodec, WaveformFrame, CHANNEL_COUNT};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// USB protocol constants
pub mod protocol {
    /// Hantek 6xx4 vendor and product ID
    pub const VENDOR_ID: u16 = 0x04b5;
    pub const PRODUCT_ID: u16 = 0x6cde;

    /// Bulk OUT endpoint for command packets
    pub const ENDPOINT_OUT: u8 = 0x02;

    /// Bulk IN endpoint for replies and waveform data
    pub const ENDPOINT_IN: u8 = 0x86;

    /// Size of one high-speed bulk packet
    pub const USB_PACKET_SIZE: usize = 512;

    /// Bulk packet size when the device enumerated at full speed
    pub const FULL_SPEED_PACKET_SIZE: usize = 64;

    /// Capture length when the packet count is 0 ("maximum")
    pub const MAX_CAPTURE_BYTES: usize = 65536;

    /// Default number of 512-byte packets requested per capture
    pub const DEFAULT_CAPTURE_PACKETS: u8 = 128;

    /// Default bulk read timeout in milliseconds
    pub const DEFAULT_BULK_TIMEOUT_MS: u64 = 1000;

    /// Bytes expected for a capture of `packets` bulk packets
    pub fn capture_len(packets: u8) -> usize {
        if packets == 0 {
            MAX_CAPTURE_BYTES
        } else {
            packets as usize * USB_PACKET_SIZE
        }
    }

    /// Vendor control requests
    pub mod request {
        /// Host-to-device vendor request
        pub const TYPE_VENDOR_OUT: u8 = 0x40;
        /// Device-to-host vendor request
        pub const TYPE_VENDOR_IN: u8 = 0xc0;

        /// Read EEPROM / version block (`wValue` = address)
        pub const READ_EEPROM: u8 = 162;
        /// Status / keepalive ping, 10-byte reply
        pub const PING: u8 = 178;
        /// Prepare for a bulk command
        pub const RESET: u8 = 179;
        /// Clear calibration state
        pub const CLEAR_CALIBRATION: u8 = 234;

        /// Payload of the reset request
        pub const RESET_PAYLOAD: [u8; 10] = [0x0f, 0x03, 0x03, 0x03, 0, 0, 0, 0, 0, 0];
        pub const PING_REPLY_LEN: usize = 10;

        /// EEPROM addresses read during bring-up
        pub const VERSION_ADDRESS: u16 = 0x1580;
        pub const VERSION_LEN: usize = 71;
        pub const DRIVER_VERSION_ADDRESS: u16 = 0x15e0;
        pub const DRIVER_VERSION_LEN: usize = 8;
    }

}
