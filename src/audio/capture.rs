//! Capture loop
//!
//! Pulls frames from the device whenever it signals and forwards the bytes to
//! a blocking sink. A sink failure ends the loop.

use crossbeam_channel::Receiver;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::audio::device::CaptureDevice;
use crate::audio::engine::{wait_any, AudioEngine, EngineState, Session, Wake};
use crate::audio::format::AudioFormat;
use crate::error::AudioError;

/// Audio capture engine over a single device session
pub struct CaptureEngine<D: CaptureDevice> {
    engine: AudioEngine<D>,

    /// Total frames delivered to sinks
    frames_captured: Arc<AtomicU64>,
}

impl<D: CaptureDevice> CaptureEngine<D> {
    /// Open the device; `None` uses its mix format at 16 bits per sample
    pub fn open(device: D, format: Option<AudioFormat>) -> Result<Self, AudioError> {
        Ok(Self {
            engine: AudioEngine::open("capture", device, format)?,
            frames_captured: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start forwarding captured PCM to `sink`
    pub fn start<W>(&mut self, sink: W) -> Result<(), AudioError>
    where
        W: Write + Send + 'static,
    {
        let frames_captured = self.frames_captured.clone();
        self.engine
            .spawn(move |session, cancel| capture_loop(session, sink, cancel, &frames_captured))
    }

    pub fn stop(&mut self) -> Result<(), AudioError> {
        self.engine.stop()
    }

    pub fn stop_timeout(&mut self, timeout: Duration) -> Result<(), AudioError> {
        self.engine.stop_timeout(timeout)
    }

    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn format(&self) -> &AudioFormat {
        self.engine.format()
    }

    pub fn buffer_frames(&self) -> u32 {
        self.engine.buffer_frames()
    }

    pub fn take_error(&mut self) -> Option<AudioError> {
        self.engine.take_error()
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }
}

fn capture_loop<D: CaptureDevice, W: Write>(
    session: &mut Session<D>,
    mut sink: W,
    cancel: &Receiver<()>,
    frames_captured: &AtomicU64,
) -> Result<(), AudioError> {
    session.device.start()?;
    let result = pump(session, &mut sink, cancel, frames_captured);
    let stopped = session.device.stop();
    result.and(stopped)
}

fn pump<D: CaptureDevice, W: Write>(
    session: &mut Session<D>,
    sink: &mut W,
    cancel: &Receiver<()>,
    frames_captured: &AtomicU64,
) -> Result<(), AudioError> {
    loop {
        match wait_any(&session.ready, cancel)? {
            Wake::Cancel => return Ok(()),
            Wake::Buffer => {
                let frames = session.device.read_frames(&mut session.buffer)?;
                let len = session.format.frames_to_bytes(frames).min(session.buffer.len());
                if len == 0 {
                    continue;
                }

                sink.write_all(&session.buffer[..len])
                    .map_err(|e| AudioError::Stream(format!("capture sink: {}", e)))?;
                frames_captured.fetch_add(frames as u64, Ordering::Relaxed);
                trace!(frames, "captured");
            }
        }
    }
}
