//! Receive side: RTP packets into per-peer playout FIFOs

use crossbeam_channel::{Sender, TrySendError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::audio::buffer::SharedFifo;
use crate::audio::level::scale_samples;
use crate::codec::{new_decoder, CodecInfo, PacketDecoder};
use crate::constants::MAX_CONCEALED_PACKETS;
use crate::error::{CodecError, TransportError};
use crate::network::{ReceivedPacket, RtpHandler};
use crate::voice::controls::VoiceControls;

struct PeerPlayout {
    decoder: Box<dyn PacketDecoder>,
    fifo: SharedFifo,
    /// Highest extended sequence played so far
    last_sequence: Option<u32>,
}

impl PeerPlayout {
    fn push(&self, mut pcm: Vec<u8>, volume: f32) {
        scale_samples(volume, &mut pcm);
        if self.fifo.write(&pcm) < pcm.len() {
            trace!("Playout FIFO full, audio dropped");
        }
    }
}

/// Transport handler decoding each peer's packets into its own FIFO
pub struct VoiceReceiver {
    info: CodecInfo,
    controls: Arc<VoiceControls>,
    peers: DashMap<SocketAddr, Mutex<PeerPlayout>>,
    errors: Sender<TransportError>,
}

impl VoiceReceiver {
    pub fn new(
        info: CodecInfo,
        controls: Arc<VoiceControls>,
        errors: Sender<TransportError>,
    ) -> Self {
        Self {
            info,
            controls,
            peers: DashMap::new(),
            errors,
        }
    }

    /// Start decoding `peer` into `fifo`; replaces any previous playout
    pub fn add_peer(&self, peer: SocketAddr, fifo: SharedFifo) -> Result<(), CodecError> {
        let decoder = new_decoder(self.info)?;
        self.peers.insert(
            peer,
            Mutex::new(PeerPlayout {
                decoder,
                fifo,
                last_sequence: None,
            }),
        );
        Ok(())
    }

    /// Stop decoding `peer` and close its FIFO
    pub fn remove_peer(&self, peer: &SocketAddr) -> bool {
        match self.peers.remove(peer) {
            Some((_, playout)) => {
                playout.lock().fifo.close();
                true
            }
            None => false,
        }
    }

    fn drop_packet(&self) {
        self.controls.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl RtpHandler for VoiceReceiver {
    fn on_received(&self, packet: ReceivedPacket) {
        if !self.controls.accepts(&packet.peer) {
            trace!("Muted peer {}, packet {} dropped", packet.peer, packet.sequence);
            return self.drop_packet();
        }
        if packet.payload_type != self.info.payload_type {
            trace!(
                "Payload type {} from {} does not match {}",
                packet.payload_type,
                packet.peer,
                self.info.payload_type
            );
            return self.drop_packet();
        }
        let Some(entry) = self.peers.get(&packet.peer) else {
            return self.drop_packet();
        };
        let mut playout = entry.lock();
        let volume = self.controls.render_volume();

        if let Some(last) = playout.last_sequence {
            if packet.sequence <= last {
                trace!("Late packet {} from {} (at {})", packet.sequence, packet.peer, last);
                return self.drop_packet();
            }

            let missing = packet.sequence - last - 1;
            if missing > 0 {
                debug!("{} packets lost from {}", missing, packet.peer);
            }
            for _ in 0..missing.min(MAX_CONCEALED_PACKETS) {
                match playout.decoder.conceal() {
                    Ok(pcm) => {
                        playout.push(pcm, volume);
                        self.controls.packets_concealed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("Concealment for {} failed: {}", packet.peer, e);
                        break;
                    }
                }
            }
        }
        playout.last_sequence = Some(packet.sequence);

        match playout.decoder.decode(&packet.payload) {
            Ok(pcm) => {
                playout.push(pcm, volume);
                self.controls.packets_received.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Packet {} from {} undecodable: {}", packet.sequence, packet.peer, e);
                self.drop_packet();
            }
        }
    }

    fn on_error(&self, error: TransportError) {
        match self.errors.try_send(error) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(error)) => debug!("Error queue full, dropped: {}", error),
        }
    }
}
