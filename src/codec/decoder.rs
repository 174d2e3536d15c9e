//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment.

use opus::Decoder;

use crate::codec::encoder::opus_channels;
use crate::codec::{CodecInfo, PacketDecoder};
use crate::error::CodecError;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    info: CodecInfo,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    /// Frames decoded
    frames_decoded: u64,
    /// Frames lost (PLC used)
    frames_lost: u64,
}

impl OpusDecoder {
    pub fn new(info: CodecInfo) -> Result<Self, CodecError> {
        let channels = opus_channels(info.format.channels()).ok_or_else(|| {
            CodecError::DecoderInit(format!(
                "Unsupported channel count: {}",
                info.format.channels()
            ))
        })?;

        let decoder = Decoder::new(info.format.sample_rate(), channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // 120ms is the longest Opus frame
        let max_frames = info.format.sample_rate() as usize * 120 / 1000;

        Ok(Self {
            decoder,
            decode_buffer: vec![0i16; max_frames * info.format.channels() as usize],
            info,
            frames_decoded: 0,
            frames_lost: 0,
        })
    }

    /// Decode into at most `max_samples` interleaved samples
    fn run(&mut self, data: &[u8], max_samples: usize) -> Result<Vec<u8>, CodecError> {
        let max_samples = max_samples.min(self.decode_buffer.len());
        let frames = self
            .decoder
            .decode(data, &mut self.decode_buffer[..max_samples], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        let total_samples = frames * self.info.format.channels() as usize;
        Ok(self.decode_buffer[..total_samples]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect())
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_lost: self.frames_lost,
            loss_rate: if self.frames_decoded + self.frames_lost > 0 {
                self.frames_lost as f32 / (self.frames_decoded + self.frames_lost) as f32
            } else {
                0.0
            },
        }
    }
}

impl PacketDecoder for OpusDecoder {
    fn info(&self) -> &CodecInfo {
        &self.info
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let max_samples = self.decode_buffer.len();
        let pcm = self.run(payload, max_samples)?;
        self.frames_decoded += 1;
        Ok(pcm)
    }

    fn conceal(&mut self) -> Result<Vec<u8>, CodecError> {
        // Concealment fills exactly the requested duration: one packet
        let packet_samples =
            self.info.samples_per_packet as usize * self.info.format.channels() as usize;
        let pcm = self.run(&[], packet_samples)?;
        self.frames_lost += 1;
        Ok(pcm)
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_lost: u64,
    pub loss_rate: f32,
}
