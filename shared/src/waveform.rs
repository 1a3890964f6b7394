/*!
Waveform decoding and the binary waveform frame.

A capture buffer interleaves the four channels byte by byte: the byte at
offset `4k + c` is sample `k` of channel `c`. The codec splits the buffer,
converts each channel to calibrated 16-bit samples and the frame type writes
them in the layout streaming clients expect.
*/

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScopeError};

/// Number of analog channels in every capture
pub const CHANNEL_COUNT: usize = 4;

/// Full 16-bit span used by the auto-range calibration
const AUTO_RANGE_SPAN: f64 = 65532.0;

const LEGACY_BIAS: i16 = 128;
const LEGACY_GAIN: i16 = 64;

/// Frame header: channel count (u16) + femtoseconds per sample (i64)
pub const FRAME_HEADER_LEN: usize = 2 + 8;

/// Channel header: index (u64), sample count (u64), scale, offset, trigger phase (f32)
pub const CHANNEL_HEADER_LEN: usize = 8 + 8 + 4 * 3;

/// How raw ADC codes are mapped onto transmitted samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPolicy {
    /// Stretch each channel's min..max over the full 16-bit range
    #[default]
    AutoRange,
    /// Fixed `(raw - 128) * 64`
    Legacy,
}

/// One channel of a decoded capture
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelWaveform {
    pub index: u64,
    pub samples: Vec<i16>,
    /// Counts per raw ADC code; a sample is `(raw - offset) * scale`
    pub scale: f32,
    /// Raw ADC code that maps to sample 0
    pub offset: f32,
    pub trigger_phase: f32,
}

impl ChannelWaveform {
    /// Reconstruct the raw ADC code a transmitted sample stands for
    pub fn raw_value(&self, sample: i16) -> f32 {
        sample as f32 / self.scale + self.offset
    }
}

/// Split a capture buffer into per-channel raw sample sequences
pub fn deinterleave(buffer: &[u8]) -> [Vec<u8>; CHANNEL_COUNT] {
    let samples = buffer.len() / CHANNEL_COUNT;
    let mut channels: [Vec<u8>; CHANNEL_COUNT] = std::array::from_fn(|_| Vec::with_capacity(samples));

    for frame in buffer.chunks_exact(CHANNEL_COUNT) {
        for (channel, &raw) in channels.iter_mut().zip(frame) {
            channel.push(raw);
        }
    }

    channels
}

/// Converts raw capture buffers into calibrated channel waveforms
#[derive(Debug, Clone, Copy, Default)]
pub struct WaveformCodec {
    policy: CalibrationPolicy,
}

impl WaveformCodec {
    pub fn new(policy: CalibrationPolicy) -> Self {
        Self { policy }
    }

    /// Decode a capture buffer into four calibrated channels
    pub fn decode(&self, buffer: &[u8]) -> Result<[ChannelWaveform; CHANNEL_COUNT]> {
        if buffer.is_empty() {
            return Err(ScopeError::capture("empty capture buffer"));
        }
        if buffer.len() % CHANNEL_COUNT != 0 {
            return Err(ScopeError::capture(format!(
                "capture buffer length {} is not a multiple of {}",
                buffer.len(),
                CHANNEL_COUNT
            )));
        }

        let raw = deinterleave(buffer);
        let mut index = 0u64;
        Ok(raw.map(|channel| {
            let waveform = match self.policy {
                CalibrationPolicy::AutoRange => calibrate_auto_range(index, &channel),
                CalibrationPolicy::Legacy => calibrate_legacy(index, &channel),
            };
            index += 1;
            waveform
        }))
    }
}

fn calibrate_auto_range(index: u64, raw: &[u8]) -> ChannelWaveform {
    let max = raw.iter().copied().max().unwrap_or(0) as f64;
    let min = raw.iter().copied().min().unwrap_or(0) as f64;
    let range = (max - min).max(1.0);
    let scale = AUTO_RANGE_SPAN / range;
    let offset = max - range / 2.0;

    let samples = raw
        .iter()
        .map(|&value| {
            ((value as f64 - offset) * scale)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect();

    ChannelWaveform {
        index,
        samples,
        scale: scale as f32,
        offset: offset as f32,
        trigger_phase: 0.0,
    }
}

fn calibrate_legacy(index: u64, raw: &[u8]) -> ChannelWaveform {
    let samples = raw
        .iter()
        .map(|&value| (value as i16 - LEGACY_BIAS) * LEGACY_GAIN)
        .collect();

    ChannelWaveform {
        index,
        samples,
        scale: LEGACY_GAIN as f32,
        offset: LEGACY_BIAS as f32,
        trigger_phase: 0.0,
    }
}

/// One capture as sent on the waveform socket
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformFrame {
    pub femtoseconds_per_sample: i64,
    pub channels: Vec<ChannelWaveform>,
}

impl WaveformFrame {
    pub fn new(femtoseconds_per_sample: i64, channels: Vec<ChannelWaveform>) -> Self {
        Self {
            femtoseconds_per_sample,
            channels,
        }
    }

    /// Size of the encoded frame in bytes
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN
            + self
                .channels
                .iter()
                .map(|c| CHANNEL_HEADER_LEN + c.samples.len() * 2)
                .sum::<usize>()
    }

    /// Encode the frame. The channel header carries `1 / scale` (value per
    /// count) so clients can rebuild `raw = sample * scale + offset`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16_le(self.channels.len() as u16);
        buf.put_i64_le(self.femtoseconds_per_sample);

        for channel in &self.channels {
            buf.put_u64_le(channel.index);
            buf.put_u64_le(channel.samples.len() as u64);
            buf.put_f32_le(1.0 / channel.scale);
            buf.put_f32_le(channel.offset);
            buf.put_f32_le(channel.trigger_phase);
            for &sample in &channel.samples {
                buf.put_i16_le(sample);
            }
        }

        buf.freeze()
    }

    /// Parse one encoded frame from the start of `data`
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < FRAME_HEADER_LEN {
            return Err(ScopeError::capture("truncated frame header"));
        }
        let channel_count = data.get_u16_le() as usize;
        let femtoseconds_per_sample = data.get_i64_le();

        let mut channels = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            if data.remaining() < CHANNEL_HEADER_LEN {
                return Err(ScopeError::capture("truncated channel header"));
            }
            let index = data.get_u64_le();
            let sample_count = data.get_u64_le() as usize;
            let wire_scale = data.get_f32_le();
            let offset = data.get_f32_le();
            let trigger_phase = data.get_f32_le();

            if data.remaining() < sample_count.saturating_mul(2) {
                return Err(ScopeError::capture(format!(
                    "channel {} truncated: {} samples announced",
                    index, sample_count
                )));
            }
            let samples = (0..sample_count).map(|_| data.get_i16_le()).collect();

            channels.push(ChannelWaveform {
                index,
                samples,
                scale: 1.0 / wire_scale,
                offset,
                trigger_phase,
            });
        }

        Ok(Self {
            femtoseconds_per_sample,
            channels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interleave(channels: &[[u8; 4]; 4]) -> Vec<u8> {
        let mut buffer = Vec::new();
        for k in 0..4 {
            for channel in channels {
                buffer.push(channel[k]);
            }
        }
        buffer
    }

    #[test]
    fn test_deinterleave_stride() {
        let buffer: Vec<u8> = (0..16).collect();
        let channels = deinterleave(&buffer);
        assert_eq!(channels[0], [0, 4, 8, 12]);
        assert_eq!(channels[3], [3, 7, 11, 15]);
    }

    #[test]
    fn test_auto_range_calibration() {
        let buffer = interleave(&[[10, 20, 30, 200], [0; 4], [1, 2, 3, 4], [255; 4]]);
        let channels = WaveformCodec::default().decode(&buffer).unwrap();

        let ch0 = &channels[0];
        let scale = 65532.0 / 190.0;
        assert_eq!(ch0.index, 0);
        assert!((ch0.scale as f64 - scale).abs() < 1e-3);
        assert_eq!(ch0.offset, 105.0);
        assert_eq!(ch0.samples[0], ((10.0 - 105.0) * scale).round() as i16);
        assert_eq!(ch0.samples[3], 32766);
        assert_eq!(ch0.trigger_phase, 0.0);

        // flat channels use a range of 1
        assert_eq!(channels[1].offset, -0.5);
        assert_eq!(channels[1].samples, [32766; 4]);
        assert_eq!(channels[3].index, 3);
    }

    #[test]
    fn test_legacy_calibration() {
        let buffer = interleave(&[[0, 128, 255, 129], [0; 4], [0; 4], [0; 4]]);
        let channels = WaveformCodec::new(CalibrationPolicy::Legacy).decode(&buffer).unwrap();

        assert_eq!(channels[0].samples, [-8192, 0, 8128, 64]);
        assert_eq!(channels[0].scale, 64.0);
        assert_eq!(channels[0].offset, 128.0);
        assert_eq!(channels[0].raw_value(8128), 255.0);
    }

    #[test]
    fn test_invalid_buffers() {
        let codec = WaveformCodec::default();
        assert!(matches!(codec.decode(&[]), Err(ScopeError::Capture(_))));
        assert!(matches!(codec.decode(&[1, 2, 3]), Err(ScopeError::Capture(_))));
    }

    #[test]
    fn test_frame_layout() {
        let buffer = interleave(&[[10, 20, 30, 200], [1; 4], [2; 4], [3; 4]]);
        let channels = WaveformCodec::default().decode(&buffer).unwrap();
        let frame = WaveformFrame::new(800_000_000, channels.to_vec());
        let bytes = frame.encode();

        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(bytes.len(), 10 + 4 * (28 + 8));
        assert_eq!(&bytes[0..2], &[4, 0]);
        assert_eq!(&bytes[2..10], &800_000_000i64.to_le_bytes());
        // first channel header: index 0, 4 samples
        assert_eq!(&bytes[10..18], &0u64.to_le_bytes());
        assert_eq!(&bytes[18..26], &4u64.to_le_bytes());
        let wire_scale = f32::from_le_bytes(bytes[26..30].try_into().unwrap());
        assert!((wire_scale - 190.0 / 65532.0).abs() < 1e-6);

        let parsed = WaveformFrame::decode(&bytes).unwrap();
        assert_eq!(parsed.femtoseconds_per_sample, 800_000_000);
        assert_eq!(parsed.channels.len(), 4);
        assert_eq!(parsed.channels[0].samples, frame.channels[0].samples);
        assert!(WaveformFrame::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
