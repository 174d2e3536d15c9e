//! Device session plus one cancellable transfer worker
//!
//! ```text
//!   Idle ──start──▶ Running ──stop──▶ Stopping ──joined──▶ Idle
//!                      │
//!                      └──loop returns on its own──▶ Idle
//! ```
//!
//! The session (device, transfer buffer, buffer-ready signal) moves into the
//! worker thread while it runs and comes back through the join handle, so the
//! transfer buffer is only ever touched by one thread at a time.

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::device::{BufferReady, DeviceSession};
use crate::audio::format::AudioFormat;
use crate::error::AudioError;

/// Lifecycle state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            _ => EngineState::Idle,
        }
    }
}

/// Everything a transfer loop needs, owned by whichever thread runs it
pub(crate) struct Session<D> {
    pub device: D,
    pub format: AudioFormat,
    pub buffer: Vec<u8>,
    pub buffer_frames: u32,
    pub ready: BufferReady,
}

type WorkerOutput<D> = (Session<D>, Result<(), AudioError>);

struct Worker<D> {
    cancel: Sender<()>,
    done: Receiver<()>,
    handle: JoinHandle<WorkerOutput<D>>,
}

/// What woke a loop up
pub(crate) enum Wake {
    Buffer,
    Cancel,
}

/// Block until the device signals or cancellation is requested.
///
/// A dropped cancel sender counts as cancellation.
pub(crate) fn wait_any(ready: &BufferReady, cancel: &Receiver<()>) -> Result<Wake, AudioError> {
    select! {
        recv(cancel) -> _ => Ok(Wake::Cancel),
        recv(ready) -> msg => match msg {
            Ok(()) => Ok(Wake::Buffer),
            Err(_) => Err(AudioError::Device("buffer-ready signal closed".into())),
        },
    }
}

/// Shared lifecycle for capture and render engines
pub struct AudioEngine<D: DeviceSession> {
    name: &'static str,
    format: AudioFormat,
    buffer_frames: u32,
    session: Option<Session<D>>,
    worker: Option<Worker<D>>,
    state: Arc<AtomicU8>,
    last_error: Option<AudioError>,
}

impl<D: DeviceSession> AudioEngine<D> {
    /// Open `device` at `format`, or at its mix format downgraded to 16-bit
    pub fn open(
        name: &'static str,
        mut device: D,
        format: Option<AudioFormat>,
    ) -> Result<Self, AudioError> {
        let format = match format {
            Some(format) => format,
            None => device.mix_format()?.with_16_bit_samples()?,
        };

        let ready = device.initialize(&format)?;
        let buffer_frames = device.buffer_frames();
        let buffer = vec![0u8; format.frames_to_bytes(buffer_frames)];

        info!(
            "{} engine opened: {} with {} frame buffer ({} bytes)",
            name,
            format,
            buffer_frames,
            buffer.len()
        );

        Ok(Self {
            name,
            format,
            buffer_frames,
            session: Some(Session {
                device,
                format,
                buffer,
                buffer_frames,
                ready,
            }),
            worker: None,
            state: Arc::new(AtomicU8::new(EngineState::Idle as u8)),
            last_error: None,
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// Size of the transfer buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.format.frames_to_bytes(self.buffer_frames)
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Error of a loop that ended on its own
    pub fn take_error(&mut self) -> Option<AudioError> {
        if self.state() == EngineState::Idle {
            self.reclaim();
        }
        self.last_error.take()
    }

    /// Spawn the worker running `run`; only valid from `Idle`
    pub(crate) fn spawn<F>(&mut self, run: F) -> Result<(), AudioError>
    where
        F: FnOnce(&mut Session<D>, &Receiver<()>) -> Result<(), AudioError> + Send + 'static,
    {
        if self.state() != EngineState::Idle {
            return Err(AudioError::AlreadyStarted);
        }
        self.reclaim();

        let mut session = self
            .session
            .take()
            .ok_or_else(|| AudioError::Device("device session lost".into()))?;

        let (cancel_tx, cancel_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let state = self.state.clone();
        let name = self.name;

        state.store(EngineState::Running as u8, Ordering::Release);

        let spawned = thread::Builder::new()
            .name(format!("audio-{}", name))
            .spawn(move || {
                let result = run(&mut session, &cancel_rx);
                match &result {
                    Ok(()) => debug!("{} loop exited", name),
                    Err(e) => error!("{} loop terminated: {}", name, e),
                }
                // A loop that ends by itself goes straight back to Idle
                let _ = state.compare_exchange(
                    EngineState::Running as u8,
                    EngineState::Idle as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                let _ = done_tx.send(());
                (session, result)
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker {
                    cancel: cancel_tx,
                    done: done_rx,
                    handle,
                });
                info!("{} engine started", name);
                Ok(())
            }
            Err(e) => {
                self.state.store(EngineState::Idle as u8, Ordering::Release);
                Err(AudioError::Device(format!("failed to spawn {} worker: {}", name, e)))
            }
        }
    }

    /// Take back the session from a worker that already finished
    fn reclaim(&mut self) {
        let Some(worker) = self.worker.take() else { return };
        let (mut session, result) = match worker.handle.join() {
            Ok(output) => output,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        // Drop audio the device queued after the loop stopped draining it
        let reset = session.device.reset();
        self.session = Some(session);
        if let Err(e) = result.and(reset) {
            warn!("{} loop had ended with an error: {}", self.name, e);
            self.last_error = Some(e);
        }
    }

    /// Cancel the worker, wait for it to exit and reset the device.
    ///
    /// A no-op when never started. The join is unbounded: a wedged device
    /// blocks the caller; use [`AudioEngine::stop_timeout`] to bound it.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        match self.join_worker() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Like [`AudioEngine::stop`] but gives up after `timeout`.
    ///
    /// On timeout the engine stays in `Stopping`; a later `stop` finishes the job.
    pub fn stop_timeout(&mut self, timeout: Duration) -> Result<(), AudioError> {
        let Some(worker) = self.worker.as_ref() else {
            return Ok(());
        };

        self.state.store(EngineState::Stopping as u8, Ordering::Release);
        let _ = worker.cancel.try_send(());

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self.stop(),
            Err(RecvTimeoutError::Timeout) => Err(AudioError::StopTimeout),
        }
    }

    /// Block until the loop finishes on its own (source exhausted, error), then reset
    pub fn wait(&mut self) -> Result<(), AudioError> {
        if let Some(worker) = self.worker.as_ref() {
            let _ = worker.done.recv();
        }
        self.stop()
    }

    fn join_worker(&mut self) -> Result<Result<(), AudioError>, Box<dyn Any + Send>> {
        let Some(worker) = self.worker.take() else {
            return Ok(Ok(()));
        };

        self.state.store(EngineState::Stopping as u8, Ordering::Release);
        let _ = worker.cancel.try_send(());

        let joined = worker.handle.join();
        let (mut session, result) = match joined {
            Ok(output) => output,
            Err(panic) => {
                self.state.store(EngineState::Idle as u8, Ordering::Release);
                return Err(panic);
            }
        };

        let reset = session.device.reset();
        self.session = Some(session);
        self.state.store(EngineState::Idle as u8, Ordering::Release);
        info!("{} engine stopped", self.name);

        Ok(result.and(reset))
    }
}

impl<D: DeviceSession> Drop for AudioEngine<D> {
    fn drop(&mut self) {
        match self.join_worker() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} engine stopped with error: {}", self.name, e),
            Err(_) => error!("{} worker panicked", self.name),
        }
    }
}
