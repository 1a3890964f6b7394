/*!
Configuration management for the bridge application.
*/

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::protocol;
use shared::{CalibrationPolicy, DeviceSettings};

use crate::controller::ControllerOptions;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    /// Settings applied before the first capture
    #[serde(default)]
    pub acquisition: DeviceSettings,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// Socket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub bind_addr: String,

    /// Line-oriented control protocol port
    pub control_port: u16,

    /// Binary waveform stream port
    pub waveform_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "localhost".to_string(),
            control_port: 5025,
            waveform_port: 5026,
        }
    }
}

/// Instrument and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,

    /// Timeout for bulk and control transfers in milliseconds
    pub bulk_timeout_ms: u64,

    /// 512-byte packets requested per capture (0 = maximum)
    pub capture_packets: u8,

    /// Sample calibration applied before streaming
    pub calibration: CalibrationPolicy,

    /// Use the synthetic instrument instead of USB hardware
    pub simulate: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_id: protocol::VENDOR_ID,
            product_id: protocol::PRODUCT_ID,
            bulk_timeout_ms: protocol::DEFAULT_BULK_TIMEOUT_MS,
            capture_packets: protocol::DEFAULT_CAPTURE_PACKETS,
            calibration: CalibrationPolicy::AutoRange,
            simulate: false,
        }
    }
}

impl DeviceConfig {
    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            capture_packets: self.capture_packets,
            bulk_timeout: self.bulk_timeout(),
            calibration: self.calibration,
        }
    }
}
