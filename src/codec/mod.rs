//! Voice codecs
//!
//! Every codec here produces fixed-size payloads so packets fit the
//! transport's single configured payload size. Encoders take one packet's
//! worth of 16-bit little-endian PCM; decoders return the same.

pub mod decoder;
pub mod encoder;
pub mod l16;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use l16::{L16Decoder, L16Encoder};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::audio::format::AudioFormat;
use crate::error::CodecError;

/// Dynamic payload type used when no static assignment fits
pub const DYNAMIC_PAYLOAD_TYPE: u8 = 96;

/// Supported codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Uncompressed 16-bit big-endian PCM
    L16,
    /// Opus at a constant bitrate
    Opus,
}

impl FromStr for CodecKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "l16" | "pcm" => Ok(CodecKind::L16),
            "opus" => Ok(CodecKind::Opus),
            other => Err(CodecError::Unsupported(format!("unknown codec '{}'", other))),
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecKind::L16 => f.write_str("l16"),
            CodecKind::Opus => f.write_str("opus"),
        }
    }
}

/// Everything the transport and the voice pipeline need to know about a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecInfo {
    pub codec: CodecKind,
    pub payload_type: u8,
    /// Encoded bytes per packet
    pub payload_size: usize,
    /// Frames (samples per channel) per packet; the RTP timestamp step
    pub samples_per_packet: u32,
    /// PCM format on the audio side
    pub format: AudioFormat,
}

impl CodecInfo {
    /// Uncompressed PCM in `frame` sized packets
    pub fn l16(format: AudioFormat, frame: Duration) -> Result<Self, CodecError> {
        if format.bits_per_sample() != 16 {
            return Err(CodecError::Unsupported(format!("L16 needs 16-bit PCM, got {}", format)));
        }
        let samples_per_packet = packet_frames(&format, frame)?;

        // RFC 3551 static assignment for 44.1 kHz mono
        let payload_type = if format.sample_rate() == 44100 && format.channels() == 1 {
            11
        } else {
            DYNAMIC_PAYLOAD_TYPE
        };

        Ok(Self {
            codec: CodecKind::L16,
            payload_type,
            payload_size: format.frames_to_bytes(samples_per_packet),
            samples_per_packet,
            format,
        })
    }

    /// Constant-bitrate Opus
    pub fn opus(format: AudioFormat, frame: Duration, bitrate: u32) -> Result<Self, CodecError> {
        if !matches!(format.sample_rate(), 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(CodecError::Unsupported(format!(
                "Opus does not run at {} Hz",
                format.sample_rate()
            )));
        }
        if !matches!(format.channels(), 1 | 2) {
            return Err(CodecError::Unsupported(format!(
                "Opus does not support {} channels",
                format.channels()
            )));
        }
        let micros = frame.as_micros();
        if !matches!(micros, 2_500 | 5_000 | 10_000 | 20_000 | 40_000 | 60_000) {
            return Err(CodecError::InvalidFrameSize(format.frames_for(frame) as usize));
        }

        let payload_size = (bitrate as u128 * micros / 8_000_000) as usize;
        if payload_size == 0 || payload_size > encoder::MAX_PACKET_SIZE {
            return Err(CodecError::Unsupported(format!(
                "bitrate {} gives a {} byte packet",
                bitrate, payload_size
            )));
        }

        Ok(Self {
            codec: CodecKind::Opus,
            payload_type: 111,
            payload_size,
            samples_per_packet: packet_frames(&format, frame)?,
            format,
        })
    }

    pub fn new(
        codec: CodecKind,
        format: AudioFormat,
        frame: Duration,
        bitrate: u32,
    ) -> Result<Self, CodecError> {
        match codec {
            CodecKind::L16 => Self::l16(format, frame),
            CodecKind::Opus => Self::opus(format, frame, bitrate),
        }
    }

    /// Replace the payload type, e.g. to match a peer's dynamic assignment
    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type & 0x7f;
        self
    }

    /// PCM bytes consumed per packet
    pub fn frame_bytes(&self) -> usize {
        self.format.frames_to_bytes(self.samples_per_packet)
    }

    pub fn packet_duration(&self) -> Duration {
        Duration::from_micros(
            self.samples_per_packet as u64 * 1_000_000 / self.format.sample_rate() as u64,
        )
    }
}

fn packet_frames(format: &AudioFormat, frame: Duration) -> Result<u32, CodecError> {
    let frames = format.frames_for(frame);
    if frames == 0 {
        return Err(CodecError::InvalidFrameSize(0));
    }
    Ok(frames)
}

/// Turns one packet of PCM into one fixed-size payload
pub trait PacketEncoder: Send {
    fn info(&self) -> &CodecInfo;

    /// `pcm` must be exactly `info().frame_bytes()` long
    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, CodecError>;
}

/// Turns payloads back into PCM
pub trait PacketDecoder: Send {
    fn info(&self) -> &CodecInfo;

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// One packet of audio standing in for a lost one
    fn conceal(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(vec![0u8; self.info().frame_bytes()])
    }
}

pub fn new_encoder(info: CodecInfo) -> Result<Box<dyn PacketEncoder>, CodecError> {
    Ok(match info.codec {
        CodecKind::L16 => Box::new(L16Encoder::new(info)),
        CodecKind::Opus => Box::new(OpusEncoder::new(info)?),
    })
}

pub fn new_decoder(info: CodecInfo) -> Result<Box<dyn PacketDecoder>, CodecError> {
    Ok(match info.codec {
        CodecKind::L16 => Box::new(L16Decoder::new(info)),
        CodecKind::Opus => Box::new(OpusDecoder::new(info)?),
    })
}

fn check_frame(info: &CodecInfo, pcm: &[u8]) -> Result<(), CodecError> {
    if pcm.len() != info.frame_bytes() {
        return Err(CodecError::InvalidFrameSize(pcm.len()));
    }
    Ok(())
}
