//! Opus encoder wrapper
//!
//! Runs the encoder in hard CBR so every packet comes out at exactly the
//! payload size the transport was configured with.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::codec::{check_frame, CodecInfo, PacketEncoder};
use crate::error::CodecError;

/// Largest packet Opus will produce
pub const MAX_PACKET_SIZE: usize = 1275;

/// Opus encoder wrapper with voice settings
pub struct OpusEncoder {
    encoder: Encoder,
    info: CodecInfo,
    /// Sample buffer (reused to avoid allocations)
    samples: Vec<i16>,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    pub fn new(info: CodecInfo) -> Result<Self, CodecError> {
        let channels = opus_channels(info.format.channels()).ok_or_else(|| {
            CodecError::EncoderInit(format!(
                "Unsupported channel count: {}",
                info.format.channels()
            ))
        })?;

        let mut encoder = Encoder::new(info.format.sample_rate(), channels, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &info)?;

        Ok(Self {
            encoder,
            samples: Vec::with_capacity(
                info.samples_per_packet as usize * info.format.channels() as usize,
            ),
            encode_buffer: vec![0u8; info.payload_size],
            info,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, info: &CodecInfo) -> Result<(), CodecError> {
        let micros = info.packet_duration().as_micros() as i64;
        let bitrate = info.payload_size as i64 * 8_000_000 / micros.max(1);

        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        // Hard CBR: constant packet size
        encoder
            .set_vbr(false)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        encoder
            .set_inband_fec(false)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        // DTX would emit short packets during silence
        encoder
            .set_dtx(false)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set DTX: {}", e)))?;

        encoder
            .set_signal(opus::Signal::Voice)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set signal type: {}", e)))?;

        Ok(())
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
        }
    }
}

impl PacketEncoder for OpusEncoder {
    fn info(&self) -> &CodecInfo {
        &self.info
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, CodecError> {
        check_frame(&self.info, pcm)?;

        self.samples.clear();
        self.samples
            .extend(pcm.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])));

        let size = self
            .encoder
            .encode(&self.samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        if size != self.info.payload_size {
            return Err(CodecError::EncodingFailed(format!(
                "encoder produced {} bytes, expected {}",
                size, self.info.payload_size
            )));
        }

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }
}

pub(crate) fn opus_channels(channels: u16) -> Option<Channels> {
    match channels {
        1 => Some(Channels::Mono),
        2 => Some(Channels::Stereo),
        _ => None,
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::AudioFormat;
    use std::time::Duration;

    fn info() -> CodecInfo {
        let format = AudioFormat::pcm16(1, 48000).unwrap();
        CodecInfo::opus(format, Duration::from_millis(20), 32_000).unwrap()
    }

    #[test]
    fn test_encoder_creation() {
        let encoder = OpusEncoder::new(info());
        assert!(encoder.is_ok());
    }

    #[test]
    fn test_cbr_packets_have_fixed_size() {
        let mut encoder = OpusEncoder::new(info()).unwrap();
        let frame_bytes = encoder.info().frame_bytes();

        let silence = vec![0u8; frame_bytes];
        assert_eq!(encoder.encode(&silence).unwrap().len(), 80);

        let tone: Vec<u8> = (0..frame_bytes / 2)
            .map(|i| ((i as f32 * 0.06).sin() * 12000.0) as i16)
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(encoder.encode(&tone).unwrap().len(), 80);

        assert_eq!(encoder.stats().frames_encoded, 2);
        assert_eq!(encoder.stats().bytes_produced, 160);
    }

    #[test]
    fn test_wrong_frame_size() {
        let mut encoder = OpusEncoder::new(info()).unwrap();
        assert!(matches!(
            encoder.encode(&[0u8; 100]),
            Err(CodecError::InvalidFrameSize(100))
        ));
    }
}
