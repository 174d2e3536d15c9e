//! Capture-side packetizer
//!
//! Sits in the capture engine as its sink. Incoming PCM is cut into codec
//! frames; each frame is gain-adjusted and metered, then encoded and delivered
//! if the transmit gate allows it. The RTP timestamp advances for every frame
//! whether or not it was sent, so receivers see silence as a timestamp jump.

use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{trace, warn};

use crate::audio::level::apply_gain;
use crate::codec::PacketEncoder;
use crate::network::RtpTransport;
use crate::voice::controls::VoiceControls;

/// Destination for encoded payloads
pub trait PacketSink: Send + 'static {
    fn deliver(&mut self, timestamp: u32, payload: &[u8]) -> io::Result<()>;
}

impl PacketSink for Arc<RtpTransport> {
    fn deliver(&mut self, timestamp: u32, payload: &[u8]) -> io::Result<()> {
        self.send(timestamp, payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// `Write` adapter turning captured PCM into packets
pub struct Transmitter<S: PacketSink> {
    encoder: Box<dyn PacketEncoder>,
    sink: S,
    controls: Arc<VoiceControls>,
    pending: Vec<u8>,
    frame: Vec<u8>,
    timestamp: u32,
}

impl<S: PacketSink> Transmitter<S> {
    pub fn new(encoder: Box<dyn PacketEncoder>, sink: S, controls: Arc<VoiceControls>) -> Self {
        let frame_bytes = encoder.info().frame_bytes();
        Self {
            encoder,
            sink,
            controls,
            pending: Vec::with_capacity(frame_bytes * 2),
            frame: Vec::with_capacity(frame_bytes),
            timestamp: 0,
        }
    }

    /// Timestamp the next frame will carry
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    fn process_frame(&mut self) -> io::Result<()> {
        let peak = apply_gain(self.controls.capture_gain_db(), &mut self.frame);
        self.controls.set_level(peak);
        self.controls.frames_processed.fetch_add(1, Ordering::Relaxed);

        if self.controls.should_transmit(peak) {
            match self.encoder.encode(&self.frame) {
                Ok(payload) => {
                    self.sink.deliver(self.timestamp, &payload)?;
                    self.controls.packets_transmitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("Dropping frame at timestamp {}: {}", self.timestamp, e),
            }
        } else {
            trace!("Frame at timestamp {} below talk level ({:.3})", self.timestamp, peak);
            self.controls.packets_suppressed.fetch_add(1, Ordering::Relaxed);
        }

        self.timestamp = self
            .timestamp
            .wrapping_add(self.encoder.info().samples_per_packet);
        Ok(())
    }
}

impl<S: PacketSink> Write for Transmitter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let frame_bytes = self.encoder.info().frame_bytes();
        self.pending.extend_from_slice(buf);

        while self.pending.len() >= frame_bytes {
            self.frame.clear();
            self.frame.extend(self.pending.drain(..frame_bytes));
            self.process_frame()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
