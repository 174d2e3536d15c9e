//! PCM format descriptor

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::AudioError;

/// Wave format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaveEncoding {
    Pcm,
    Adpcm,
    MpegLayer3,
    Other(u16),
}

impl WaveEncoding {
    pub fn from_tag(tag: u16) -> Self {
        match tag {
            0x0001 => WaveEncoding::Pcm,
            0x0002 => WaveEncoding::Adpcm,
            0x0055 => WaveEncoding::MpegLayer3,
            other => WaveEncoding::Other(other),
        }
    }

    pub fn tag(self) -> u16 {
        match self {
            WaveEncoding::Pcm => 0x0001,
            WaveEncoding::Adpcm => 0x0002,
            WaveEncoding::MpegLayer3 => 0x0055,
            WaveEncoding::Other(tag) => tag,
        }
    }
}

/// Immutable audio format.
///
/// `block_align` (bytes per frame) and `bytes_per_second` are derived once at
/// construction; a format whose block align would be zero cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    encoding: WaveEncoding,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    block_align: u16,
    bytes_per_second: u32,
}

impl AudioFormat {
    /// Create a PCM format
    pub fn pcm(channels: u16, sample_rate: u32, bits_per_sample: u16) -> Result<Self, AudioError> {
        Self::new(WaveEncoding::Pcm, channels, sample_rate, bits_per_sample)
    }

    /// 16-bit PCM, the only sample width the device engines move
    pub fn pcm16(channels: u16, sample_rate: u32) -> Result<Self, AudioError> {
        Self::pcm(channels, sample_rate, 16)
    }

    pub fn new(
        encoding: WaveEncoding,
        channels: u16,
        sample_rate: u32,
        bits_per_sample: u16,
    ) -> Result<Self, AudioError> {
        let block_align = channels as u32 * bits_per_sample as u32 / 8;
        if block_align == 0 || block_align > u16::MAX as u32 {
            return Err(AudioError::Format(format!(
                "{} channel(s) at {} bits per sample has no usable block align",
                channels, bits_per_sample
            )));
        }
        if sample_rate == 0 {
            return Err(AudioError::Format("sample rate must be non-zero".into()));
        }

        let bytes_per_second = sample_rate
            .checked_mul(block_align)
            .ok_or_else(|| AudioError::Format(format!("sample rate {} too large", sample_rate)))?;

        Ok(Self {
            encoding,
            channels,
            sample_rate,
            bits_per_sample,
            block_align: block_align as u16,
            bytes_per_second,
        })
    }

    pub fn encoding(&self) -> WaveEncoding {
        self.encoding
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    /// Bytes per frame (one sample for every channel)
    pub fn block_align(&self) -> u16 {
        self.block_align
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.bytes_per_second
    }

    /// Same channel layout and rate, 16 bits per sample
    pub fn with_16_bit_samples(&self) -> Result<Self, AudioError> {
        Self::pcm16(self.channels, self.sample_rate)
    }

    pub fn frames_to_bytes(&self, frames: u32) -> usize {
        frames as usize * self.block_align as usize
    }

    /// Whole frames contained in `bytes`; a trailing partial frame is ignored
    pub fn bytes_to_frames(&self, bytes: usize) -> u32 {
        (bytes / self.block_align as usize) as u32
    }

    /// Number of frames covering `duration` (rounded down)
    pub fn frames_for(&self, duration: Duration) -> u32 {
        (self.sample_rate as u128 * duration.as_micros() / 1_000_000) as u32
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {}Hz {}ch {}-bit",
            self.encoding, self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_fields() {
        let format = AudioFormat::pcm(2, 44100, 16).unwrap();
        assert_eq!(format.block_align(), 4);
        assert_eq!(format.bytes_per_second(), 176_400);
        assert_eq!(format.encoding(), WaveEncoding::Pcm);
    }

    #[test]
    fn test_zero_block_align_rejected() {
        assert!(matches!(AudioFormat::pcm(0, 48000, 16), Err(AudioError::Format(_))));
        assert!(matches!(AudioFormat::pcm(1, 48000, 4), Err(AudioError::Format(_))));
    }

    #[test]
    fn test_downgrade_to_16_bit() {
        let float = AudioFormat::pcm(2, 48000, 32).unwrap();
        let pcm16 = float.with_16_bit_samples().unwrap();
        assert_eq!(pcm16.bits_per_sample(), 16);
        assert_eq!(pcm16.block_align(), 4);
        assert_eq!(pcm16.sample_rate(), 48000);
    }

    #[test]
    fn test_frame_conversions() {
        let format = AudioFormat::pcm16(1, 48000).unwrap();
        assert_eq!(format.frames_to_bytes(480), 960);
        assert_eq!(format.bytes_to_frames(961), 480);
        assert_eq!(format.frames_for(Duration::from_millis(10)), 480);
    }

    #[test]
    fn test_encoding_tags() {
        assert_eq!(WaveEncoding::from_tag(1), WaveEncoding::Pcm);
        assert_eq!(WaveEncoding::from_tag(0xfffe), WaveEncoding::Other(0xfffe));
        assert_eq!(WaveEncoding::MpegLayer3.tag(), 0x55);
    }
}
