//! Render loop
//!
//! Pre-fills the device buffer, then on every signal tops the device up with
//! exactly as many frames as it has room for. A short read from the source
//! marks it exhausted; the loop commits what it got and exits on the next
//! signal.

use crossbeam_channel::Receiver;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::audio::device::RenderDevice;
use crate::audio::engine::{wait_any, AudioEngine, EngineState, Session, Wake};
use crate::audio::format::AudioFormat;
use crate::error::AudioError;

/// Audio render engine over a single device session
pub struct RenderEngine<D: RenderDevice> {
    engine: AudioEngine<D>,

    /// Total frames committed to the device
    frames_rendered: Arc<AtomicU64>,
}

impl<D: RenderDevice> RenderEngine<D> {
    /// Open the device; `None` uses its mix format at 16 bits per sample
    pub fn open(device: D, format: Option<AudioFormat>) -> Result<Self, AudioError> {
        Ok(Self {
            engine: AudioEngine::open("render", device, format)?,
            frames_rendered: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start playing PCM pulled from `source` until it runs dry or `stop` is called
    pub fn start<R>(&mut self, source: R) -> Result<(), AudioError>
    where
        R: Read + Send + 'static,
    {
        let frames_rendered = self.frames_rendered.clone();
        self.engine
            .spawn(move |session, cancel| render_loop(session, source, cancel, &frames_rendered))
    }

    pub fn stop(&mut self) -> Result<(), AudioError> {
        self.engine.stop()
    }

    pub fn stop_timeout(&mut self, timeout: Duration) -> Result<(), AudioError> {
        self.engine.stop_timeout(timeout)
    }

    /// Block until the source is exhausted and playback has wound down
    pub fn wait(&mut self) -> Result<(), AudioError> {
        self.engine.wait()
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

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }
}

fn render_loop<D: RenderDevice, R: Read>(
    session: &mut Session<D>,
    mut source: R,
    cancel: &Receiver<()>,
    frames_rendered: &AtomicU64,
) -> Result<(), AudioError> {
    let block_align = session.format.block_align() as usize;

    let prefill = session.buffer.len();
    let read = read_source(&mut source, &mut session.buffer[..prefill])?;
    if read == 0 {
        debug!("Render source empty, device not started");
        return Ok(());
    }
    let mut exhausted = read < prefill;
    commit(session, read / block_align * block_align, frames_rendered)?;

    session.device.start()?;
    let result = pump(session, &mut source, cancel, &mut exhausted, frames_rendered);
    let stopped = session.device.stop();
    result.and(stopped)
}

fn pump<D: RenderDevice, R: Read>(
    session: &mut Session<D>,
    source: &mut R,
    cancel: &Receiver<()>,
    exhausted: &mut bool,
    frames_rendered: &AtomicU64,
) -> Result<(), AudioError> {
    let block_align = session.format.block_align() as usize;

    loop {
        match wait_any(&session.ready, cancel)? {
            Wake::Cancel => return Ok(()),
            Wake::Buffer => {
                if *exhausted {
                    debug!("Render source exhausted");
                    return Ok(());
                }

                let padding = session.device.padding()?;
                let headroom = session.buffer_frames.saturating_sub(padding);
                if headroom == 0 {
                    continue;
                }

                let wanted = session.format.frames_to_bytes(headroom).min(session.buffer.len());
                let read = read_source(source, &mut session.buffer[..wanted])?;
                if read == 0 {
                    return Ok(());
                }
                if read < wanted {
                    *exhausted = true;
                }

                commit(session, read / block_align * block_align, frames_rendered)?;
            }
        }
    }
}

fn commit<D: RenderDevice>(
    session: &mut Session<D>,
    len: usize,
    frames_rendered: &AtomicU64,
) -> Result<(), AudioError> {
    if len == 0 {
        return Ok(());
    }
    session.device.write_frames(&session.buffer[..len])?;

    let frames = session.format.bytes_to_frames(len);
    frames_rendered.fetch_add(frames as u64, Ordering::Relaxed);
    trace!(frames, "rendered");
    Ok(())
}

/// One read from the source, retried only on interruption
fn read_source<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, AudioError> {
    loop {
        match source.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AudioError::Stream(format!("render source: {}", e))),
        }
    }
}
