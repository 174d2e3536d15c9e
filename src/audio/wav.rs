//! RIFF/WAVE header reader
//!
//! Parses the container just far enough to describe the PCM data region.
//! Used for file playback and for producing test fixtures.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::audio::format::{AudioFormat, WaveEncoding};
use crate::error::AudioError;

const RIFF: &[u8; 4] = b"RIFF";
const WAVE: &[u8; 4] = b"WAVE";
const FMT: &[u8; 4] = b"fmt ";
const DATA: &[u8; 4] = b"data";

/// Size of the canonical PCM header produced by [`wav_header`]
pub const WAV_HEADER_SIZE: usize = 44;

/// Reader positioned on the data chunk of a WAV stream
pub struct WavReader<R> {
    inner: io::Take<R>,
    format: AudioFormat,
    data_len: u32,
    data_offset: u64,
}

impl WavReader<BufReader<File>> {
    /// Open a WAV file from disk
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| AudioError::InvalidWav(format!("{}: {}", path.display(), e)))?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> WavReader<R> {
    /// Parse the header and leave the stream at the first data byte
    pub fn new(mut reader: R) -> Result<Self, AudioError> {
        let mut riff = [0u8; 12];
        read_header_bytes(&mut reader, &mut riff)?;
        if &riff[0..4] != RIFF || u32_le(&riff[4..8]) == 0 || &riff[8..12] != WAVE {
            return Err(AudioError::InvalidWav("not a RIFF/WAVE stream".into()));
        }

        let mut offset = riff.len() as u64;
        let mut format = None;

        loop {
            let mut chunk = [0u8; 8];
            read_header_bytes(&mut reader, &mut chunk)?;
            offset += chunk.len() as u64;

            let id = &chunk[0..4];
            let size = u32_le(&chunk[4..8]);

            if id == FMT {
                format = Some(read_format(&mut reader, size)?);
            } else if id == DATA {
                let format = format
                    .ok_or_else(|| AudioError::InvalidWav("data chunk before fmt chunk".into()))?;
                return Ok(Self {
                    inner: reader.take(size as u64),
                    format,
                    data_len: size,
                    data_offset: offset,
                });
            } else {
                skip(&mut reader, size as u64)?;
            }

            // Chunks are word aligned
            if size & 1 == 1 {
                skip(&mut reader, 1)?;
            }
            offset += size as u64 + (size as u64 & 1);
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Length of the data region in bytes
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// Offset of the first data byte from the start of the stream
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

/// Fills `buf` completely unless the data region ends first, so a short
/// read always marks the end of the audio.
impl<R: Read> Read for WavReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if filled > 0 => {
                    debug!("WAV read error after {} bytes: {}", filled, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

fn read_format<R: Read>(reader: &mut R, size: u32) -> Result<AudioFormat, AudioError> {
    if size < 16 {
        return Err(AudioError::InvalidWav(format!("fmt chunk too short ({} bytes)", size)));
    }

    let mut fmt = [0u8; 16];
    read_header_bytes(reader, &mut fmt)?;
    skip(reader, (size - 16) as u64)?;

    let encoding = WaveEncoding::from_tag(u16_le(&fmt[0..2]));
    let channels = u16_le(&fmt[2..4]);
    let sample_rate = u32_le(&fmt[4..8]);
    let bits_per_sample = u16_le(&fmt[14..16]);

    AudioFormat::new(encoding, channels, sample_rate, bits_per_sample)
        .map_err(|e| AudioError::InvalidWav(e.to_string()))
}

fn read_header_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), AudioError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => AudioError::InvalidWav("truncated header".into()),
        _ => AudioError::InvalidWav(e.to_string()),
    })
}

fn skip<R: Read>(reader: &mut R, count: u64) -> Result<(), AudioError> {
    let skipped = io::copy(&mut reader.by_ref().take(count), &mut io::sink())
        .map_err(|e| AudioError::InvalidWav(e.to_string()))?;
    if skipped < count {
        return Err(AudioError::InvalidWav("could not find wave data".into()));
    }
    Ok(())
}

fn u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Build a canonical 44-byte header for `data_len` bytes of `format` audio.
///
/// Layout:
/// ```text
/// [0-3]    "RIFF"
/// [4-7]    36 + data_len
/// [8-11]   "WAVE"
/// [12-15]  "fmt "
/// [16-19]  16
/// [20-21]  format tag
/// [22-23]  channels
/// [24-27]  sample rate
/// [28-31]  bytes per second
/// [32-33]  block align
/// [34-35]  bits per sample
/// [36-39]  "data"
/// [40-43]  data_len
/// ```
pub fn wav_header(format: &AudioFormat, data_len: u32) -> [u8; WAV_HEADER_SIZE] {
    let mut header = [0u8; WAV_HEADER_SIZE];

    header[0..4].copy_from_slice(RIFF);
    header[4..8].copy_from_slice(&data_len.saturating_add(36).to_le_bytes());
    header[8..12].copy_from_slice(WAVE);

    header[12..16].copy_from_slice(FMT);
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&format.encoding().tag().to_le_bytes());
    header[22..24].copy_from_slice(&format.channels().to_le_bytes());
    header[24..28].copy_from_slice(&format.sample_rate().to_le_bytes());
    header[28..32].copy_from_slice(&format.bytes_per_second().to_le_bytes());
    header[32..34].copy_from_slice(&format.block_align().to_le_bytes());
    header[34..36].copy_from_slice(&format.bits_per_sample().to_le_bytes());

    header[36..40].copy_from_slice(DATA);
    header[40..44].copy_from_slice(&data_len.to_le_bytes());

    header
}
