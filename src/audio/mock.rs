//! Scripted devices and sinks for engine tests

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::device::{AudioBackend, BufferReady, CaptureDevice, DeviceSession, RenderDevice};
use crate::audio::format::AudioFormat;
use crate::error::AudioError;

/// Poll `cond` until it holds or `timeout` elapses
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[derive(Default)]
struct Counters {
    starts: AtomicUsize,
    stops: AtomicUsize,
    resets: AtomicUsize,
}

fn mock_mix_format() -> AudioFormat {
    // Float mix format, as most shared-mode devices report
    AudioFormat::pcm(2, 48000, 32).unwrap()
}

/// Capture device that reports the frame counts pushed through its handle
pub(crate) struct MockCapture {
    buffer_frames: u32,
    block_align: usize,
    reject_format: bool,
    script: Arc<Mutex<VecDeque<u32>>>,
    _ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
    counters: Arc<Counters>,
}

#[derive(Clone)]
pub(crate) struct CaptureHandle {
    script: Arc<Mutex<VecDeque<u32>>>,
    ready_tx: Sender<()>,
    counters: Arc<Counters>,
}

impl MockCapture {
    pub fn new(buffer_frames: u32) -> (Self, CaptureHandle) {
        let (ready_tx, ready_rx) = unbounded();
        let script = Arc::new(Mutex::new(VecDeque::new()));
        let counters = Arc::new(Counters::default());
        let handle = CaptureHandle {
            script: script.clone(),
            ready_tx: ready_tx.clone(),
            counters: counters.clone(),
        };
        let device = Self {
            buffer_frames,
            block_align: 1,
            reject_format: false,
            script,
            _ready_tx: ready_tx,
            ready_rx,
            counters,
        };
        (device, handle)
    }

    pub fn rejecting_format(mut self) -> Self {
        self.reject_format = true;
        self
    }
}

impl CaptureHandle {
    /// Make `frames` available and raise the buffer-ready signal
    pub fn emit(&self, frames: u32) {
        self.script.lock().push_back(frames);
        let _ = self.ready_tx.send(());
    }

    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.counters.resets.load(Ordering::SeqCst)
    }
}

impl DeviceSession for MockCapture {
    fn mix_format(&self) -> Result<AudioFormat, AudioError> {
        Ok(mock_mix_format())
    }

    fn initialize(&mut self, format: &AudioFormat) -> Result<BufferReady, AudioError> {
        if self.reject_format {
            return Err(AudioError::Format(format!("{} rejected", format)));
        }
        self.block_align = format.block_align() as usize;
        Ok(self.ready_rx.clone())
    }

    fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), AudioError> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl CaptureDevice for MockCapture {
    fn read_frames(&mut self, buf: &mut [u8]) -> Result<u32, AudioError> {
        let requested = self.script.lock().pop_front().unwrap_or(0);
        let frames = requested.min((buf.len() / self.block_align) as u32);
        let len = frames as usize * self.block_align;
        for (i, byte) in buf[..len].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        Ok(frames)
    }
}

/// Render device recording every committed byte
pub(crate) struct MockRender {
    buffer_frames: u32,
    auto_tick: bool,
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
    shared: Arc<RenderShared>,
}

#[derive(Default)]
struct RenderShared {
    written: Mutex<Vec<u8>>,
    padding: AtomicU32,
    counters: Counters,
}

#[derive(Clone)]
pub(crate) struct RenderHandle {
    ready_tx: Sender<()>,
    shared: Arc<RenderShared>,
}

impl MockRender {
    /// With `auto_tick` the device asks for more audio on start and after every write
    pub fn new(buffer_frames: u32, auto_tick: bool) -> (Self, RenderHandle) {
        let (ready_tx, ready_rx) = bounded(1);
        let shared = Arc::new(RenderShared::default());
        let handle = RenderHandle {
            ready_tx: ready_tx.clone(),
            shared: shared.clone(),
        };
        let device = Self {
            buffer_frames,
            auto_tick,
            ready_tx,
            ready_rx,
            shared,
        };
        (device, handle)
    }

    fn signal(&self) {
        if self.auto_tick {
            let _ = self.ready_tx.try_send(());
        }
    }
}

impl RenderHandle {
    /// Raise the buffer-ready signal once
    pub fn tick(&self) {
        let _ = self.ready_tx.try_send(());
    }

    pub fn set_padding(&self, frames: u32) {
        self.shared.padding.store(frames, Ordering::SeqCst);
    }

    pub fn written(&self) -> Vec<u8> {
        self.shared.written.lock().clone()
    }

    pub fn written_len(&self) -> usize {
        self.shared.written.lock().len()
    }

    pub fn starts(&self) -> usize {
        self.shared.counters.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.shared.counters.stops.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.shared.counters.resets.load(Ordering::SeqCst)
    }
}

impl DeviceSession for MockRender {
    fn mix_format(&self) -> Result<AudioFormat, AudioError> {
        Ok(mock_mix_format())
    }

    fn initialize(&mut self, _format: &AudioFormat) -> Result<BufferReady, AudioError> {
        Ok(self.ready_rx.clone())
    }

    fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    fn start(&mut self) -> Result<(), AudioError> {
        self.shared.counters.starts.fetch_add(1, Ordering::SeqCst);
        self.signal();
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.shared.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), AudioError> {
        self.shared.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl RenderDevice for MockRender {
    fn padding(&self) -> Result<u32, AudioError> {
        Ok(self.shared.padding.load(Ordering::SeqCst))
    }

    fn write_frames(&mut self, data: &[u8]) -> Result<(), AudioError> {
        self.shared.written.lock().extend_from_slice(data);
        self.signal();
        Ok(())
    }
}

/// Backend handing out mock devices; the handles of every device it created
/// stay reachable for assertions
#[derive(Default)]
pub(crate) struct MockBackend {
    pub captures: Mutex<Vec<CaptureHandle>>,
    pub renders: Mutex<Vec<RenderHandle>>,
}

impl MockBackend {
    pub const BUFFER_FRAMES: u32 = 960;

    pub fn capture(&self, index: usize) -> Option<CaptureHandle> {
        self.captures.lock().get(index).cloned()
    }

    pub fn render(&self, index: usize) -> Option<RenderHandle> {
        self.renders.lock().get(index).cloned()
    }
}

impl AudioBackend for Arc<MockBackend> {
    type Capture = MockCapture;
    type Render = MockRender;

    fn capture_device(&self) -> Result<MockCapture, AudioError> {
        let (device, handle) = MockCapture::new(MockBackend::BUFFER_FRAMES);
        self.captures.lock().push(handle);
        Ok(device)
    }

    fn render_device(&self) -> Result<MockRender, AudioError> {
        let (device, handle) = MockRender::new(MockBackend::BUFFER_FRAMES, false);
        self.renders.lock().push(handle);
        Ok(device)
    }
}

/// Sink collecting everything written to it
#[derive(Clone, Default)]
pub(crate) struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink whose every write fails
pub(crate) struct FailingSink;

impl Write for FailingSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub(crate) struct SourceStats {
    reads: Arc<AtomicUsize>,
    bytes: Arc<AtomicUsize>,
}

impl SourceStats {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Source wrapper counting reads and delivered bytes
pub(crate) struct CountingSource<R> {
    inner: R,
    stats: SourceStats,
}

impl<R> CountingSource<R> {
    pub fn new(inner: R) -> (Self, SourceStats) {
        let stats = SourceStats::default();
        (
            Self {
                inner,
                stats: stats.clone(),
            },
            stats,
        )
    }
}

impl<R: Read> Read for CountingSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        self.stats.bytes.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}
