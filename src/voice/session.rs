//! Voice session: one capture engine, one RTP transport, one render engine per peer
//!
//! ```text
//! capture ──► Transmitter ──► RtpTransport ──► peers
//!                                  │
//!                        VoiceReceiver (per peer decoder)
//!                                  │
//!                   FIFO ──► PlayoutReader ──► render (per peer)
//! ```

use crossbeam_channel::{bounded, Receiver};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::buffer::{FifoBuffer, PlayoutReader, SharedFifo};
use crate::audio::device::AudioBackend;
use crate::audio::{CaptureEngine, RenderEngine};
use crate::codec::{new_encoder, CodecInfo};
use crate::constants::MAX_PLAYOUT_MS;
use crate::error::{AudioError, Result, TransportError};
use crate::network::{RtpConfig, RtpTransport};
use crate::voice::controls::{
    ReceivePredicate, TransmitPredicate, VoiceControls, VoiceOptions, VoiceStats,
};
use crate::voice::receive::VoiceReceiver;
use crate::voice::transmit::Transmitter;

const ERROR_QUEUE: usize = 64;

struct PeerRender<B: AudioBackend> {
    engine: RenderEngine<B::Render>,
    fifo: SharedFifo,
}

/// Bidirectional voice link with a set of peers
pub struct VoiceSession<B: AudioBackend> {
    backend: B,
    info: CodecInfo,
    transport: Arc<RtpTransport>,
    receiver: Arc<VoiceReceiver>,
    capture: CaptureEngine<B::Capture>,
    renders: HashMap<SocketAddr, PeerRender<B>>,
    controls: Arc<VoiceControls>,
    errors: Receiver<TransportError>,
    open: bool,
}

impl<B: AudioBackend> VoiceSession<B> {
    /// Create a closed session on `socket`.
    ///
    /// The capture device is opened at the codec's PCM format; each peer gets
    /// a render device at the same format when it is added.
    pub fn new(
        backend: B,
        info: CodecInfo,
        socket: UdpSocket,
        options: VoiceOptions,
    ) -> Result<Self> {
        let controls = Arc::new(VoiceControls::new(&options));
        let (errors_tx, errors) = bounded(ERROR_QUEUE);
        let receiver = Arc::new(VoiceReceiver::new(info, controls.clone(), errors_tx));

        let config = RtpConfig::new(info.payload_type, info.payload_size)
            .with_keepalive_interval(options.keepalive_interval)
            .with_poll_interval(options.poll_interval);
        let transport = Arc::new(RtpTransport::with_socket(socket, config, receiver.clone())?);

        let capture = CaptureEngine::open(backend.capture_device()?, Some(info.format))?;

        info!(
            "Voice session: {} {} at {} byte payloads, {:?} per packet",
            info.codec,
            info.format,
            info.payload_size,
            info.packet_duration()
        );

        Ok(Self {
            backend,
            info,
            transport,
            receiver,
            capture,
            renders: HashMap::new(),
            controls,
            errors,
            open: false,
        })
    }

    pub fn info(&self) -> &CodecInfo {
        &self.info
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.transport.peers()
    }

    /// Start the transport, the peer renders and the capture; no-op when open
    pub fn open(&mut self) -> Result<()> {
        if self.open {
            return Ok(());
        }

        self.transport.open()?;
        if let Err(e) = self.start_audio() {
            let _ = self.stop_audio();
            self.transport.close();
            return Err(e);
        }

        self.open = true;
        info!("Voice session open with {} peers", self.renders.len());
        Ok(())
    }

    fn start_audio(&mut self) -> Result<()> {
        for render in self.renders.values_mut() {
            render.fifo.clear();
            render.engine.start(PlayoutReader(render.fifo.clone()))?;
        }

        let encoder = new_encoder(self.info)?;
        let transmitter = Transmitter::new(encoder, self.transport.clone(), self.controls.clone());
        self.capture.start(transmitter)?;
        Ok(())
    }

    /// Stop everything started by `open`; no-op when closed.
    ///
    /// Returns the first audio error, after all parts were stopped.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }

        let result = self.stop_audio();
        self.transport.close();
        self.open = false;
        info!("Voice session closed");
        result.map_err(Into::into)
    }

    fn stop_audio(&mut self) -> std::result::Result<(), AudioError> {
        let mut result = self.capture.stop();
        for (peer, render) in self.renders.iter_mut() {
            if let Err(e) = render.engine.stop() {
                warn!("Render for {} failed: {}", peer, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Add a peer to send to and play from; false if it was already present
    pub fn add_peer(&mut self, peer: SocketAddr) -> Result<bool> {
        if self.renders.contains_key(&peer) {
            return Ok(false);
        }

        let format = self.info.format;
        let mut engine = RenderEngine::open(self.backend.render_device()?, Some(format))?;
        let playout_bytes =
            format.frames_to_bytes(format.frames_for(Duration::from_millis(MAX_PLAYOUT_MS)));
        let fifo: SharedFifo = Arc::new(FifoBuffer::bounded(playout_bytes));

        self.receiver.add_peer(peer, fifo.clone())?;
        if self.open {
            if let Err(e) = engine.start(PlayoutReader(fifo.clone())) {
                self.receiver.remove_peer(&peer);
                return Err(e.into());
            }
        }
        self.renders.insert(peer, PeerRender { engine, fifo });

        // Registered last so no packet arrives before its playout exists
        self.transport.add_peer(peer);
        Ok(true)
    }

    /// Stop sending to and playing from `peer`; false if it was not present
    pub fn remove_peer(&mut self, peer: &SocketAddr) -> bool {
        self.transport.remove_peer(peer);
        self.receiver.remove_peer(peer);

        let Some(mut render) = self.renders.remove(peer) else {
            return false;
        };
        if let Err(e) = render.engine.stop() {
            warn!("Render for {} failed: {}", peer, e);
        }
        render.fifo.close();
        true
    }

    /// Peak of the latest captured frame (0.0 - 1.0)
    pub fn level(&self) -> f32 {
        self.controls.level()
    }

    /// Asynchronous transport errors; the queue drops the newest errors when full
    pub fn errors(&self) -> &Receiver<TransportError> {
        &self.errors
    }

    /// First error that stopped the capture or a render loop
    pub fn take_audio_error(&mut self) -> Option<AudioError> {
        if let Some(e) = self.capture.take_error() {
            return Some(e);
        }
        self.renders.values_mut().find_map(|render| render.engine.take_error())
    }

    pub fn stats(&self) -> VoiceStats {
        self.controls
            .snapshot(self.capture.frames_captured(), self.transport.stats())
    }

    pub fn controls(&self) -> &Arc<VoiceControls> {
        &self.controls
    }

    pub fn set_capture_gain_db(&self, gain_db: f32) {
        self.controls.set_capture_gain_db(gain_db);
    }

    pub fn set_render_volume(&self, volume: f32) {
        self.controls.set_render_volume(volume);
    }

    pub fn set_talk_level(&self, level: Option<f32>) {
        self.controls.set_talk_level(level);
    }

    pub fn set_transmit_predicate(&self, predicate: Option<TransmitPredicate>) {
        self.controls.set_transmit_predicate(predicate);
    }

    pub fn set_receive_predicate(&self, predicate: Option<ReceivePredicate>) {
        self.controls.set_receive_predicate(predicate);
    }
}

impl<B: AudioBackend> Drop for VoiceSession<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Voice session closed with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mock::{wait_until, MockBackend};
    use crate::audio::{AudioFormat, EngineState};
    use crate::network::{bind_socket, RtpHeader, HEADER_SIZE};

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    /// L16 mono 8 kHz, 20 ms: 160 samples, 320 byte payloads
    fn session() -> (VoiceSession<Arc<MockBackend>>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        let format = AudioFormat::pcm16(1, 8000).unwrap();
        let info = CodecInfo::l16(format, Duration::from_millis(20)).unwrap();
        let options = VoiceOptions {
            poll_interval: Duration::from_millis(20),
            ..VoiceOptions::default()
        };
        let socket = bind_socket(loopback(), None).unwrap();
        let session = VoiceSession::new(backend.clone(), info, socket, options).unwrap();
        (session, backend)
    }

    fn remote() -> UdpSocket {
        let socket = UdpSocket::bind(loopback()).unwrap();
        socket.set_read_timeout(Some(TIMEOUT)).unwrap();
        socket
    }

    fn rtp_packet(sequence: u16, sample: i16) -> Vec<u8> {
        let mut buf = Vec::new();
        RtpHeader {
            payload_type: 96,
            sequence,
            timestamp: sequence as u32 * 160,
            ssrc: 0x1234,
        }
        .write_to(&mut buf);
        for _ in 0..160 {
            buf.extend_from_slice(&sample.to_be_bytes());
        }
        buf
    }

    fn count_samples(pcm: &[u8], sample: i16) -> usize {
        pcm.chunks_exact(2)
            .filter(|c| *c == sample.to_le_bytes())
            .count()
    }

    #[test]
    fn test_capture_is_sent_to_peers() {
        let (mut session, backend) = session();
        let peer = remote();
        assert!(session.add_peer(peer.local_addr().unwrap()).unwrap());
        session.open().unwrap();

        backend.capture(0).unwrap().emit(320);

        let mut buf = [0u8; 1500];
        let mut timestamps = Vec::new();
        for _ in 0..2 {
            let (len, _) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(len, HEADER_SIZE + 320);
            let header = RtpHeader::parse(&buf[..len]).unwrap();
            assert_eq!(header.payload_type, 96);
            assert_eq!(header.ssrc, session.transport.ssrc());
            timestamps.push(header.timestamp);
        }
        assert_eq!(timestamps, vec![0, 160]);

        // Mock capture bytes are i % 251; the first LE sample [0, 1] goes out big-endian
        backend.capture(0).unwrap().emit(160);
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(len, HEADER_SIZE + 320);
        assert_eq!(&buf[HEADER_SIZE..HEADER_SIZE + 2], &[1, 0]);

        session.close().unwrap();
        assert_eq!(session.stats().packets_transmitted, 3);
    }

    #[test]
    fn test_suppressed_frames_keep_timestamps_moving() {
        let (mut session, backend) = session();
        let peer = remote();
        session.add_peer(peer.local_addr().unwrap()).unwrap();
        session.set_transmit_predicate(Some(Box::new(|_| false)));
        session.open().unwrap();

        let capture = backend.capture(0).unwrap();
        capture.emit(320);
        assert!(wait_until(TIMEOUT, || session.stats().packets_suppressed == 2));

        session.set_transmit_predicate(None);
        capture.emit(160);

        let mut buf = [0u8; 1500];
        let (len, _) = peer.recv_from(&mut buf).unwrap();
        let header = RtpHeader::parse(&buf[..len]).unwrap();
        assert_eq!(header.timestamp, 320);
        assert_eq!(header.sequence, 0);
    }

    #[test]
    fn test_received_audio_is_rendered() {
        let (mut session, backend) = session();
        let peer = remote();
        session.add_peer(peer.local_addr().unwrap()).unwrap();
        session.open().unwrap();

        let target = session.local_addr().unwrap();
        peer.send_to(&rtp_packet(0, 0x0102), target).unwrap();
        assert!(wait_until(TIMEOUT, || session.stats().packets_received == 1));

        let render = backend.render(0).unwrap();
        assert!(wait_until(TIMEOUT, || {
            render.tick();
            count_samples(&render.written(), 0x0102) == 160
        }));
    }

    #[test]
    fn test_receive_predicate_mutes_peer() {
        let (mut session, _backend) = session();
        let peer = remote();
        let muted = peer.local_addr().unwrap();
        session.add_peer(muted).unwrap();
        session.set_receive_predicate(Some(Box::new(move |from| *from != muted)));
        session.open().unwrap();

        let target = session.local_addr().unwrap();
        peer.send_to(&rtp_packet(0, 7), target).unwrap();
        assert!(wait_until(TIMEOUT, || session.stats().packets_dropped == 1));
        assert_eq!(session.stats().packets_received, 0);
        assert_eq!(session.stats().rtp.packets_received, 1);
    }

    #[test]
    fn test_lost_packets_concealed() {
        let (mut session, _backend) = session();
        let peer = remote();
        session.add_peer(peer.local_addr().unwrap()).unwrap();
        session.open().unwrap();

        let target = session.local_addr().unwrap();
        peer.send_to(&rtp_packet(0, 7), target).unwrap();
        assert!(wait_until(TIMEOUT, || session.stats().packets_received == 1));
        peer.send_to(&rtp_packet(3, 7), target).unwrap();
        assert!(wait_until(TIMEOUT, || session.stats().packets_received == 2));
        assert_eq!(session.stats().packets_concealed, 2);
    }

    #[test]
    fn test_peer_membership() {
        let (mut session, backend) = session();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        assert!(session.add_peer(peer).unwrap());
        assert!(!session.add_peer(peer).unwrap());
        assert_eq!(session.peers(), vec![peer]);
        assert_eq!(backend.renders.lock().len(), 1);

        assert!(session.remove_peer(&peer));
        assert!(!session.remove_peer(&peer));
        assert!(session.peers().is_empty());
    }

    #[test]
    fn test_open_close_idempotent() {
        let (mut session, backend) = session();
        session.add_peer("127.0.0.1:40001".parse().unwrap()).unwrap();

        session.close().unwrap();
        session.open().unwrap();
        session.open().unwrap();
        assert!(session.is_open());
        assert!(session.transport.is_open());
        assert!(wait_until(TIMEOUT, || backend.capture(0).unwrap().starts() == 1));

        session.close().unwrap();
        session.close().unwrap();
        assert!(!session.is_open());
        assert!(!session.transport.is_open());
        assert_eq!(session.capture.state(), EngineState::Idle);

        // Reopens on the same devices
        session.open().unwrap();
        assert!(wait_until(TIMEOUT, || backend.capture(0).unwrap().starts() == 2));
    }

    #[test]
    fn test_peer_added_while_open_is_rendered() {
        let (mut session, backend) = session();
        session.open().unwrap();

        let peer = remote();
        session.add_peer(peer.local_addr().unwrap()).unwrap();
        let render = backend.render(0).unwrap();
        assert!(wait_until(TIMEOUT, || render.starts() == 1));

        peer.send_to(&rtp_packet(0, 0x0304), session.local_addr().unwrap())
            .unwrap();
        assert!(wait_until(TIMEOUT, || {
            render.tick();
            count_samples(&render.written(), 0x0304) == 160
        }));
    }
}
