//! cpal-backed device sessions
//!
//! cpal streams are callback driven and cannot leave the thread that built
//! them, so each session owns a small host thread holding the stream. The
//! stream callback moves PCM through a bounded FIFO sized to the session
//! buffer and raises the buffer-ready signal after every period.
//!
//! Streams run in the device's native sample type; the callback converts to
//! and from the session's 16-bit PCM.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::audio::buffer::{FifoBuffer, SharedFifo};
use crate::audio::device::{
    find_device, AudioBackend, BufferReady, CaptureDevice, DeviceSession, Direction, RenderDevice,
};
use crate::audio::format::{AudioFormat, WaveEncoding};
use crate::constants::DEFAULT_DEVICE_BUFFER_MS;
use crate::error::AudioError;

#[derive(Debug, Clone, Copy)]
enum StreamCommand {
    Play,
    Pause,
    Shutdown,
}

/// Running host thread of an initialized session
struct StreamHost {
    commands: Sender<StreamCommand>,
    replies: Receiver<Result<(), AudioError>>,
    handle: Option<JoinHandle<()>>,
}

/// Device session on top of a cpal stream
pub struct CpalDevice {
    direction: Direction,
    device_name: Option<String>,
    buffer_duration: Duration,
    format: Option<AudioFormat>,
    buffer_frames: u32,
    fifo: SharedFifo,
    host: Option<StreamHost>,
}

impl CpalDevice {
    /// Session on a capture device (`None` selects the default input)
    pub fn capture(device_name: Option<String>, buffer_duration: Duration) -> Self {
        Self::new(Direction::Capture, device_name, buffer_duration)
    }

    /// Session on a render device (`None` selects the default output)
    pub fn render(device_name: Option<String>, buffer_duration: Duration) -> Self {
        Self::new(Direction::Render, device_name, buffer_duration)
    }

    fn new(direction: Direction, device_name: Option<String>, buffer_duration: Duration) -> Self {
        Self {
            direction,
            device_name,
            buffer_duration,
            format: None,
            buffer_frames: 0,
            fifo: Arc::new(FifoBuffer::new()),
            host: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn command(&self, command: StreamCommand) -> Result<(), AudioError> {
        let host = self
            .host
            .as_ref()
            .ok_or_else(|| AudioError::Device("session not initialized".into()))?;

        host.commands
            .send(command)
            .map_err(|_| AudioError::Device("stream host exited".into()))?;
        host.replies
            .recv()
            .map_err(|_| AudioError::Device("stream host exited".into()))?
    }

    fn block_align(&self) -> usize {
        self.format.map(|f| f.block_align() as usize).unwrap_or(1)
    }
}

impl DeviceSession for CpalDevice {
    fn mix_format(&self) -> Result<AudioFormat, AudioError> {
        let device = find_device(self.direction, self.device_name.as_deref())?;
        let config = match self.direction {
            Direction::Capture => device.default_input_config(),
            Direction::Render => device.default_output_config(),
        }
        .map_err(|e| AudioError::Device(e.to_string()))?;

        AudioFormat::pcm16(config.channels(), config.sample_rate().0)
    }

    fn initialize(&mut self, format: &AudioFormat) -> Result<BufferReady, AudioError> {
        if self.host.is_some() {
            return Err(AudioError::Device("session already initialized".into()));
        }
        if format.encoding() != WaveEncoding::Pcm || format.bits_per_sample() != 16 {
            return Err(AudioError::Format(format!("{} is not 16-bit PCM", format)));
        }

        let buffer_frames = format.frames_for(self.buffer_duration).max(1);
        let fifo = Arc::new(FifoBuffer::bounded(format.frames_to_bytes(buffer_frames)));

        let (ready_tx, ready_rx) = bounded(1);
        let (command_tx, command_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let (init_tx, init_rx) = bounded(1);

        let direction = self.direction;
        let device_name = self.device_name.clone();
        let stream_format = *format;
        let stream_fifo = fifo.clone();

        let handle = thread::Builder::new()
            .name(format!("cpal-{}-host", direction))
            .spawn(move || {
                run_stream_host(
                    direction,
                    device_name,
                    stream_format,
                    stream_fifo,
                    ready_tx,
                    command_rx,
                    reply_tx,
                    init_tx,
                )
            })
            .map_err(|e| AudioError::Device(e.to_string()))?;

        let init = init_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::Device("stream host exited".into())));
        if let Err(e) = init {
            let _ = handle.join();
            return Err(e);
        }

        info!(
            "Opened {} device {} at {} ({} frames)",
            direction,
            self.device_name.as_deref().unwrap_or("<default>"),
            format,
            buffer_frames
        );

        self.format = Some(*format);
        self.buffer_frames = buffer_frames;
        self.fifo = fifo;
        self.host = Some(StreamHost {
            commands: command_tx,
            replies: reply_rx,
            handle: Some(handle),
        });

        Ok(ready_rx)
    }

    fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.command(StreamCommand::Play)
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.command(StreamCommand::Pause)
    }

    fn reset(&mut self) -> Result<(), AudioError> {
        self.fifo.clear();
        Ok(())
    }
}

impl CaptureDevice for CpalDevice {
    fn read_frames(&mut self, buf: &mut [u8]) -> Result<u32, AudioError> {
        let block_align = self.block_align();
        let whole = buf.len() / block_align * block_align;
        let read = self.fifo.read_available(&mut buf[..whole]);
        Ok((read / block_align) as u32)
    }
}

impl RenderDevice for CpalDevice {
    fn padding(&self) -> Result<u32, AudioError> {
        Ok((self.fifo.len() / self.block_align()) as u32)
    }

    fn write_frames(&mut self, data: &[u8]) -> Result<(), AudioError> {
        self.fifo.write(data);
        Ok(())
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        if let Some(mut host) = self.host.take() {
            let _ = host.commands.send(StreamCommand::Shutdown);
            if let Some(handle) = host.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_stream_host(
    direction: Direction,
    device_name: Option<String>,
    format: AudioFormat,
    fifo: SharedFifo,
    ready: Sender<()>,
    commands: Receiver<StreamCommand>,
    replies: Sender<Result<(), AudioError>>,
    init: Sender<Result<(), AudioError>>,
) {
    let stream = match build_stream(direction, device_name.as_deref(), &format, fifo, ready) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = init.send(Err(e));
            return;
        }
    };

    // Some hosts start streams as soon as they are built
    if let Err(e) = stream.pause() {
        debug!("Initial pause of {} stream failed: {}", direction, e);
    }
    let _ = init.send(Ok(()));

    for command in commands.iter() {
        let reply = match command {
            StreamCommand::Play => stream.play().map_err(|e| AudioError::Device(e.to_string())),
            StreamCommand::Pause => stream.pause().map_err(|e| AudioError::Device(e.to_string())),
            StreamCommand::Shutdown => break,
        };
        let _ = replies.send(reply);
    }

    debug!("{} stream host exiting", direction);
}

fn build_stream(
    direction: Direction,
    device_name: Option<&str>,
    format: &AudioFormat,
    fifo: SharedFifo,
    ready: Sender<()>,
) -> Result<cpal::Stream, AudioError> {
    let device = find_device(direction, device_name)?;

    // Shared-mode hosts often only take the device's native sample type
    let sample_format = match direction {
        Direction::Capture => device.default_input_config(),
        Direction::Render => device.default_output_config(),
    }
    .map_err(|e| AudioError::Device(e.to_string()))?
    .sample_format();

    let config = cpal::StreamConfig {
        channels: format.channels(),
        sample_rate: cpal::SampleRate(format.sample_rate()),
        buffer_size: cpal::BufferSize::Default,
    };
    let scratch = fifo.capacity().unwrap_or_default();

    debug!("Building {} stream with {:?} samples", direction, sample_format);

    let stream = match (direction, sample_format) {
        (Direction::Capture, SampleFormat::I16) => {
            input_stream::<i16>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Capture, SampleFormat::U16) => {
            input_stream::<u16>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Capture, SampleFormat::I32) => {
            input_stream::<i32>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Capture, SampleFormat::F32) => {
            input_stream::<f32>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Capture, SampleFormat::F64) => {
            input_stream::<f64>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Render, SampleFormat::I16) => {
            output_stream::<i16>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Render, SampleFormat::U16) => {
            output_stream::<u16>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Render, SampleFormat::I32) => {
            output_stream::<i32>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Render, SampleFormat::F32) => {
            output_stream::<f32>(&device, &config, fifo, ready, scratch)
        }
        (Direction::Render, SampleFormat::F64) => {
            output_stream::<f64>(&device, &config, fifo, ready, scratch)
        }
        (_, other) => {
            return Err(AudioError::Format(format!(
                "{} device uses unsupported sample format {:?}",
                direction, other
            )))
        }
    };

    stream.map_err(|e| match e {
        cpal::BuildStreamError::StreamConfigNotSupported => {
            AudioError::Format(format!("{} rejected by {} device", format, direction))
        }
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceNotFound(device_name.unwrap_or("<default>").to_string())
        }
        other => AudioError::Device(other.to_string()),
    })
}

fn stream_error(direction: Direction) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| error!("{} stream error: {}", direction, err)
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    fifo: SharedFifo,
    ready: Sender<()>,
    scratch: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let mut bytes = Vec::with_capacity(scratch);
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            encode_samples(data, &mut bytes);
            fifo.write(&bytes);
            let _ = ready.try_send(());
        },
        stream_error(Direction::Capture),
        None,
    )
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    fifo: SharedFifo,
    ready: Sender<()>,
    scratch: usize,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<i16>,
{
    let mut bytes = vec![0u8; scratch];
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let len = data.len() * 2;
            if bytes.len() < len {
                bytes.resize(len, 0);
            }
            let pcm = &mut bytes[..len];
            // Whatever the FIFO cannot supply stays zero and plays as silence
            pcm.fill(0);
            fifo.read_available(pcm);
            decode_samples(pcm, data);
            let _ = ready.try_send(());
        },
        stream_error(Direction::Render),
        None,
    )
}

/// Device samples to 16-bit little-endian PCM, reusing `out`
fn encode_samples<T>(data: &[T], out: &mut Vec<u8>)
where
    T: Sample,
    i16: FromSample<T>,
{
    out.clear();
    for &sample in data {
        out.extend_from_slice(&i16::from_sample(sample).to_le_bytes());
    }
}

/// 16-bit little-endian PCM to device samples
fn decode_samples<T>(pcm: &[u8], out: &mut [T])
where
    T: Sample + FromSample<i16>,
{
    for (sample, bytes) in out.iter_mut().zip(pcm.chunks_exact(2)) {
        *sample = T::from_sample(i16::from_le_bytes([bytes[0], bytes[1]]));
    }
}

/// Backend opening cpal sessions on named (or default) devices
#[derive(Debug, Clone)]
pub struct CpalBackend {
    pub capture_device: Option<String>,
    pub render_device: Option<String>,
    pub buffer_duration: Duration,
}

impl CpalBackend {
    pub fn new(capture_device: Option<String>, render_device: Option<String>) -> Self {
        Self {
            capture_device,
            render_device,
            buffer_duration: Duration::from_millis(DEFAULT_DEVICE_BUFFER_MS as u64),
        }
    }

    pub fn with_buffer_duration(mut self, buffer_duration: Duration) -> Self {
        self.buffer_duration = buffer_duration;
        self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl AudioBackend for CpalBackend {
    type Capture = CpalDevice;
    type Render = CpalDevice;

    fn capture_device(&self) -> Result<CpalDevice, AudioError> {
        Ok(CpalDevice::capture(self.capture_device.clone(), self.buffer_duration))
    }

    fn render_device(&self) -> Result<CpalDevice, AudioError> {
        Ok(CpalDevice::render(self.render_device.clone(), self.buffer_duration))
    }
}
