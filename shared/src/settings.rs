/*!
Acquisition settings and the device-specific derivations computed from them.

The instrument does not take sample rates or trigger voltages directly: the
sample rate becomes a raw timebase divisor and the trigger voltage becomes a
set of comparator levels. Both mappings are reproduced exactly as the vendor
firmware expects them.
*/

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScopeError};

/// ADC clock the timebase divisor is derived from
pub const BASE_CLOCK_HZ: u64 = 250_000_000;

/// Highest accepted sample rate
pub const MAX_SAMPLE_RATE_HZ: u64 = 250_000_000;

/// Lowest accepted sample rate
pub const MIN_SAMPLE_RATE_HZ: u64 = 1_000_000;

pub const DEFAULT_SAMPLE_RATE_HZ: u64 = 1_250_000;
pub const DEFAULT_TRIGGER_VOLTAGE_V: f64 = 1.0;

/// Raw timebase written when the divisor formula underflows
pub const DEFAULT_TIMEBASE_RAW: u32 = 1_250_000;

/// Rates the divisor can hit exactly (`125 MHz / (raw + 1)`), ascending
pub const SUPPORTED_RATES_HZ: [u64; 8] = [
    1_000_000,
    1_250_000,
    2_500_000,
    5_000_000,
    12_500_000,
    25_000_000,
    62_500_000,
    125_000_000,
];

/// Front-end constants used by the trigger-level mapping
const CHANNEL_OFFSET_V: f64 = 1.0;
const VOLTS_PER_DIVISION: f64 = 0.5;
const VERTICAL_DIVISIONS: f64 = 8.0;
const TRIGGER_LEVEL_SPAN: f64 = 200.0;
const TRIGGER_LEVEL_BASE: f64 = 28.5;
const TRIGGER_HYSTERESIS: f64 = 4.0;
const TRIGGER_LEVEL_MAX: f64 = 228.0;

/// Trigger edge direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSlope {
    #[default]
    Rising,
    Falling,
}

impl TriggerSlope {
    /// Flag byte carried by the slope command
    pub fn flag(self) -> u8 {
        match self {
            Self::Rising => 0,
            Self::Falling => 1,
        }
    }

    /// Parse a slope name as sent by control clients (`RISING`, `RIS`, `FALL`, ...)
    pub fn parse(text: &str) -> Option<Self> {
        let upper = text.trim().to_ascii_uppercase();
        if upper.starts_with("RIS") {
            Some(Self::Rising)
        } else if upper.starts_with("FALL") {
            Some(Self::Falling)
        } else {
            None
        }
    }
}

/// User-facing acquisition settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub sample_rate_hz: u64,
    pub trigger_voltage_v: f64,
    pub trigger_slope: TriggerSlope,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            trigger_voltage_v: DEFAULT_TRIGGER_VOLTAGE_V,
            trigger_slope: TriggerSlope::Rising,
        }
    }
}

impl DeviceSettings {
    /// Check the settings against what the instrument supports
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&self.sample_rate_hz) {
            return Err(ScopeError::configuration(format!(
                "sample rate {} Hz outside {}..={} Hz",
                self.sample_rate_hz, MIN_SAMPLE_RATE_HZ, MAX_SAMPLE_RATE_HZ
            )));
        }
        if !self.trigger_voltage_v.is_finite() {
            return Err(ScopeError::configuration("trigger voltage must be finite"));
        }
        Ok(())
    }

    /// Raw timebase divisor for the configured sample rate
    pub fn timebase_raw(&self) -> u32 {
        timebase_raw(self.sample_rate_hz)
    }

    /// Comparator levels for the configured trigger voltage
    pub fn trigger_level(&self) -> TriggerLevel {
        TriggerLevel::from_voltage(self.trigger_voltage_v)
    }

    /// Sample interval as carried in the waveform frame header
    pub fn femtoseconds_per_sample(&self) -> i64 {
        (1_000_000_000_000_000u64 / self.sample_rate_hz.max(1)) as i64
    }
}

/// `floor(250 MHz / rate / 2) - 1`, or the driver default when that underflows
pub fn timebase_raw(sample_rate_hz: u64) -> u32 {
    if sample_rate_hz == 0 {
        return DEFAULT_TIMEBASE_RAW;
    }
    let raw = (BASE_CLOCK_HZ / sample_rate_hz / 2) as i64 - 1;
    if raw < 0 {
        DEFAULT_TIMEBASE_RAW
    } else {
        u32::try_from(raw).unwrap_or(u32::MAX)
    }
}

/// Trigger comparator levels: a hysteresis window around the trigger level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerLevel {
    pub hi: u8,
    pub lo: u8,
    pub level: u8,
}

impl TriggerLevel {
    /// Unclamped comparator midpoint for a trigger voltage
    pub fn middle(trigger_voltage_v: f64) -> f64 {
        let full_scale = VERTICAL_DIVISIONS * VOLTS_PER_DIVISION;
        let position = (trigger_voltage_v + CHANNEL_OFFSET_V) / full_scale;
        position * TRIGGER_LEVEL_SPAN + TRIGGER_LEVEL_BASE
    }

    pub fn from_voltage(trigger_voltage_v: f64) -> Self {
        let middle = Self::middle(trigger_voltage_v);
        let lo = (middle - TRIGGER_HYSTERESIS).clamp(0.0, TRIGGER_LEVEL_MAX);
        let hi = (middle + TRIGGER_HYSTERESIS).clamp(0.0, TRIGGER_LEVEL_MAX);

        Self {
            hi: hi as u8,
            lo: lo as u8,
            // the level byte is not clamped, only cut to 8 bits
            level: (middle as i64 & 0xff) as u8,
        }
    }
}

/// Trigger status as reported by the read-trigger-status command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerStatus {
    pub trig23: u16,
    pub trig45: u8,
}

impl TriggerStatus {
    /// Parse the first bytes of a trigger status reply
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        if reply.len() < 5 {
            return None;
        }
        Some(Self {
            trig23: u16::from_le_bytes([reply[2], reply[3]]),
            trig45: reply[4],
        })
    }

    /// Trigger position the vendor driver derives from this status.
    ///
    /// Not written to the device: the capture cycle always writes position 0.
    /// Kept so the value can be logged next to the one actually used.
    pub fn derived_position(&self) -> u16 {
        const CHANNELS: i64 = 4;
        const FPGA_DIV_TIMEBASE: i64 = 0;
        const TRIGGER_X_DIV100: f64 = 0.5;

        let d8 = (1.0 - TRIGGER_X_DIV100) * 4096.0;
        let mut j3 = self.trig23 as i64 - CHANNELS * (d8 * (TRIGGER_X_DIV100 * 4096.0)) as i64;
        if j3 < 0 {
            j3 += 65536;
        }

        let j5 = (7 - self.trig45 as i64) & 7;
        let j = (1 & j5) - 6;

        let mut j6 = j3 + j * CHANNELS - FPGA_DIV_TIMEBASE * CHANNELS;
        if j6 < 0 {
            j6 += 65536;
        }

        (j6 & 0xffff) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timebase_raw_boundaries() {
        assert_eq!(timebase_raw(1_000_000), 124);
        assert_eq!(timebase_raw(1_250_000), 99);
        assert_eq!(timebase_raw(125_000_000), 0);
        // floor(0.5) - 1 is negative: driver default
        assert_eq!(timebase_raw(250_000_000), DEFAULT_TIMEBASE_RAW);
    }

    #[test]
    fn test_supported_rates_are_exact() {
        for rate in SUPPORTED_RATES_HZ {
            let raw = timebase_raw(rate) as u64;
            assert_eq!(BASE_CLOCK_HZ / 2 / (raw + 1), rate);
        }
        assert!(SUPPORTED_RATES_HZ.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_trigger_level_formula() {
        assert_eq!(TriggerLevel::middle(-1.0), 28.5);
        assert_eq!(
            TriggerLevel::from_voltage(-1.0),
            TriggerLevel { hi: 32, lo: 24, level: 28 }
        );

        assert_eq!(TriggerLevel::middle(0.0), 78.5);
        assert_eq!(
            TriggerLevel::from_voltage(0.0),
            TriggerLevel { hi: 82, lo: 74, level: 78 }
        );
    }

    #[test]
    fn test_trigger_level_clamping() {
        // middle = 228.5, hi would be 232.5
        let level = TriggerLevel::from_voltage(3.0);
        assert_eq!(level.hi, 228);
        assert_eq!(level.lo, 224);
        assert_eq!(level.level, 228);

        let low = TriggerLevel::from_voltage(-2.0);
        assert_eq!(low.lo, 0);
        assert_eq!(low.hi, 0);
    }

    #[test]
    fn test_settings_validation() {
        assert!(DeviceSettings::default().validate().is_ok());

        let too_fast = DeviceSettings { sample_rate_hz: 300_000_000, ..Default::default() };
        assert!(matches!(too_fast.validate(), Err(ScopeError::Configuration(_))));

        let too_slow = DeviceSettings { sample_rate_hz: 999_999, ..Default::default() };
        assert!(too_slow.validate().is_err());

        let max = DeviceSettings { sample_rate_hz: MAX_SAMPLE_RATE_HZ, ..Default::default() };
        assert!(max.validate().is_ok());
    }

    #[test]
    fn test_femtoseconds_per_sample() {
        let settings = DeviceSettings::default();
        assert_eq!(settings.femtoseconds_per_sample(), 800_000_000);

        let fast = DeviceSettings { sample_rate_hz: 125_000_000, ..Default::default() };
        assert_eq!(fast.femtoseconds_per_sample(), 8_000_000);
    }

    #[test]
    fn test_slope_parsing() {
        assert_eq!(TriggerSlope::parse("RISING"), Some(TriggerSlope::Rising));
        assert_eq!(TriggerSlope::parse("ris"), Some(TriggerSlope::Rising));
        assert_eq!(TriggerSlope::parse("FALL"), Some(TriggerSlope::Falling));
        assert_eq!(TriggerSlope::parse("either"), None);
    }

    #[test]
    fn test_trigger_status() {
        let reply = [0x00, 0x00, 0x34, 0x12, 0x05, 0xff];
        let status = TriggerStatus::from_reply(&reply).unwrap();
        assert_eq!(status.trig23, 0x1234);
        assert_eq!(status.trig45, 5);
        assert!(TriggerStatus::from_reply(&[0, 1, 2]).is_none());

        let idle = TriggerStatus { trig23: 0, trig45: 7 };
        assert_eq!(idle.derived_position(), 65512);
    }
}
