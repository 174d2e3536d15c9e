//! Local monitor: capture through the codec straight back to a render device

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::buffer::{FifoBuffer, PlayoutReader, SharedFifo};
use crate::audio::device::AudioBackend;
use crate::audio::level::scale_samples;
use crate::audio::{CaptureEngine, RenderEngine};
use crate::codec::{new_decoder, new_encoder, CodecInfo, PacketDecoder};
use crate::constants::MAX_PLAYOUT_MS;
use crate::error::Result;
use crate::voice::controls::{VoiceControls, VoiceOptions};
use crate::voice::transmit::{PacketSink, Transmitter};

/// Decodes payloads directly into a playout FIFO
struct LoopbackSink {
    decoder: Box<dyn PacketDecoder>,
    fifo: SharedFifo,
    controls: Arc<VoiceControls>,
}

impl PacketSink for LoopbackSink {
    fn deliver(&mut self, _timestamp: u32, payload: &[u8]) -> io::Result<()> {
        let mut pcm = self
            .decoder
            .decode(payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        scale_samples(self.controls.render_volume(), &mut pcm);
        self.fifo.write(&pcm);
        Ok(())
    }
}

/// Microphone test without a network
pub struct VoiceLoopback<B: AudioBackend> {
    info: CodecInfo,
    capture: CaptureEngine<B::Capture>,
    render: RenderEngine<B::Render>,
    fifo: SharedFifo,
    controls: Arc<VoiceControls>,
    running: bool,
}

impl<B: AudioBackend> VoiceLoopback<B> {
    pub fn new(backend: &B, info: CodecInfo, options: VoiceOptions) -> Result<Self> {
        let capture = CaptureEngine::open(backend.capture_device()?, Some(info.format))?;
        let render = RenderEngine::open(backend.render_device()?, Some(info.format))?;
        let playout_bytes = info
            .format
            .frames_to_bytes(info.format.frames_for(Duration::from_millis(MAX_PLAYOUT_MS)));

        Ok(Self {
            info,
            capture,
            render,
            fifo: Arc::new(FifoBuffer::bounded(playout_bytes)),
            controls: Arc::new(VoiceControls::new(&options)),
            running: false,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }

        self.fifo.clear();
        let sink = LoopbackSink {
            decoder: new_decoder(self.info)?,
            fifo: self.fifo.clone(),
            controls: self.controls.clone(),
        };
        let transmitter = Transmitter::new(new_encoder(self.info)?, sink, self.controls.clone());

        self.render.start(PlayoutReader(self.fifo.clone()))?;
        if let Err(e) = self.capture.start(transmitter) {
            let _ = self.render.stop();
            return Err(e.into());
        }

        self.running = true;
        info!("Loopback running: {} {}", self.info.codec, self.info.format);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;

        let captured = self.capture.stop();
        let rendered = self.render.stop();
        info!("Loopback stopped");
        captured.and(rendered).map_err(Into::into)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn level(&self) -> f32 {
        self.controls.level()
    }

    pub fn set_capture_gain_db(&self, gain_db: f32) {
        self.controls.set_capture_gain_db(gain_db);
    }

    pub fn set_render_volume(&self, volume: f32) {
        self.controls.set_render_volume(volume);
    }
}

impl<B: AudioBackend> Drop for VoiceLoopback<B> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Loopback stopped with error: {}", e);
        }
    }
}
