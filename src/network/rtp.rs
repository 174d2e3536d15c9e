//! RTP transport engine
//!
//! One UDP socket, a registry of peers, and a dedicated receive thread.
//!
//! - `send` fans one packet out to every registered peer. Per-peer failures go
//!   to the error callback and never stop delivery to the others.
//! - The receive thread accepts only exact-size packets from registered peers,
//!   extends their sequence numbers and hands them to the handler.
//! - With no inbound traffic for the keepalive interval, a zero-length
//!   datagram goes to every peer to keep NAT bindings open.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::constants::{DEFAULT_KEEPALIVE_SECS, DEFAULT_POLL_INTERVAL_MS};
use crate::error::TransportError;
use crate::network::packet::{ReceivedPacket, RtpHeader, HEADER_SIZE};
use crate::network::peers::PeerRegistry;
use crate::network::socket::bind_socket;

/// Transport parameters
#[derive(Debug, Clone, Copy)]
pub struct RtpConfig {
    /// 7-bit payload type stamped on every packet
    pub payload_type: u8,
    /// Fixed payload size; anything else is rejected on send and dropped on receive
    pub payload_size: usize,
    pub keepalive_interval: Duration,
    /// How often the receive thread wakes to check for cancellation
    pub poll_interval: Duration,
}

impl RtpConfig {
    pub fn new(payload_type: u8, payload_size: usize) -> Self {
        Self {
            payload_type,
            payload_size,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Header plus payload
    pub fn packet_size(&self) -> usize {
        HEADER_SIZE + self.payload_size
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.payload_type > 0x7f {
            return Err(TransportError::InvalidConfig(format!(
                "payload type {} does not fit in 7 bits",
                self.payload_type
            )));
        }
        if self.payload_size == 0 {
            return Err(TransportError::InvalidConfig("payload size must be positive".into()));
        }
        if self.keepalive_interval.is_zero() || self.poll_interval.is_zero() {
            return Err(TransportError::InvalidConfig("intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// Callbacks from the transport, invoked on the receive thread (packets,
/// receive and keepalive errors) or the sending thread (send errors)
pub trait RtpHandler: Send + Sync + 'static {
    fn on_received(&self, packet: ReceivedPacket);

    fn on_error(&self, error: TransportError);
}

/// Transport callback as a channel message
#[derive(Debug)]
pub enum RtpEvent {
    Received(ReceivedPacket),
    Error(TransportError),
}

impl RtpHandler for Sender<RtpEvent> {
    fn on_received(&self, packet: ReceivedPacket) {
        let _ = self.send(RtpEvent::Received(packet));
    }

    fn on_error(&self, error: TransportError) {
        let _ = self.send(RtpEvent::Error(error));
    }
}

/// Transport counters
#[derive(Debug, Default)]
pub struct RtpStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    keepalives_sent: AtomicU64,
    send_errors: AtomicU64,
    receive_errors: AtomicU64,
}

/// Point-in-time copy of [`RtpStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RtpStatsSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub keepalives_sent: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
}

impl RtpStats {
    pub fn snapshot(&self) -> RtpStatsSnapshot {
        RtpStatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

struct SendState {
    buffer: Vec<u8>,
    sequence: u16,
}

struct ReceiveWorker {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// RTP over UDP with fan-out to registered peers
pub struct RtpTransport {
    socket: Arc<UdpSocket>,
    config: RtpConfig,
    ssrc: u32,
    peers: Arc<PeerRegistry>,
    send_state: Mutex<SendState>,
    handler: Arc<dyn RtpHandler>,
    stats: Arc<RtpStats>,
    worker: Mutex<Option<ReceiveWorker>>,
}

impl RtpTransport {
    /// Transport on an ephemeral port of all IPv4 interfaces
    pub fn new(config: RtpConfig, handler: Arc<dyn RtpHandler>) -> Result<Self, TransportError> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], 0)), config, handler)
    }

    /// Transport on a freshly bound socket
    pub fn bind(
        addr: SocketAddr,
        config: RtpConfig,
        handler: Arc<dyn RtpHandler>,
    ) -> Result<Self, TransportError> {
        let socket = bind_socket(addr, None)?;
        Self::with_socket(socket, config, handler)
    }

    /// Transport on a pre-bound socket
    pub fn with_socket(
        socket: UdpSocket,
        config: RtpConfig,
        handler: Arc<dyn RtpHandler>,
    ) -> Result<Self, TransportError> {
        config.validate()?;

        let ssrc = rand::random::<u32>();
        debug!(
            "RTP transport on {:?}: ssrc {:08x}, payload type {}, {} byte payloads",
            socket.local_addr().ok(),
            ssrc,
            config.payload_type,
            config.payload_size
        );

        Ok(Self {
            socket: Arc::new(socket),
            send_state: Mutex::new(SendState {
                buffer: Vec::with_capacity(config.packet_size()),
                sequence: 0,
            }),
            config,
            ssrc,
            peers: Arc::new(PeerRegistry::new()),
            handler,
            stats: Arc::new(RtpStats::default()),
            worker: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Random session identifier carried in every header
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn config(&self) -> &RtpConfig {
        &self.config
    }

    /// Wire sequence number the next `send` will use
    pub fn next_sequence(&self) -> u16 {
        self.send_state.lock().sequence
    }

    pub fn stats(&self) -> RtpStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_open(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Register a peer; false if it was already registered
    pub fn add_peer(&self, peer: SocketAddr) -> bool {
        let added = self.peers.add(peer);
        if added {
            info!("Added RTP peer {}", peer);
        }
        added
    }

    /// Unregister a peer; false if it was not registered
    pub fn remove_peer(&self, peer: &SocketAddr) -> bool {
        let removed = self.peers.remove(peer);
        if removed {
            info!("Removed RTP peer {}", peer);
        }
        removed
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.snapshot()
    }

    /// Start the receive thread; returns once it is waiting for packets
    pub fn open(&self) -> Result<(), TransportError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let wake = self.config.poll_interval.min(self.config.keepalive_interval);
        self.socket
            .set_read_timeout(Some(wake))
            .map_err(TransportError::Receive)?;

        let (cancel_tx, cancel_rx) = bounded(1);
        let (started_tx, started_rx) = bounded(1);

        let receiver = ReceiveLoop {
            socket: self.socket.clone(),
            peers: self.peers.clone(),
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            packet_size: self.config.packet_size(),
            keepalive_interval: self.config.keepalive_interval,
            cancel: cancel_rx,
        };

        let handle = thread::Builder::new()
            .name("rtp-receive".into())
            .spawn(move || receiver.run(started_tx))
            .map_err(TransportError::Receive)?;

        let _ = started_rx.recv();

        *worker = Some(ReceiveWorker {
            cancel: cancel_tx,
            handle,
        });
        info!("RTP transport open on {:?}", self.socket.local_addr().ok());
        Ok(())
    }

    /// Stop the receive thread and wait for it; a no-op when already closed
    pub fn close(&self) {
        if let Err(panic) = self.shutdown() {
            std::panic::resume_unwind(panic);
        }
    }

    fn shutdown(&self) -> thread::Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };

        let _ = worker.cancel.send(());
        worker.handle.join()?;
        info!("RTP transport closed");
        Ok(())
    }

    /// Send one packet to every registered peer.
    ///
    /// Only a wrong payload size is returned as an error; socket failures are
    /// reported per peer through the handler.
    pub fn send(&self, timestamp: u32, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() != self.config.payload_size {
            return Err(TransportError::PayloadSize {
                expected: self.config.payload_size,
                actual: payload.len(),
            });
        }

        let mut failures = Vec::new();
        {
            let mut state = self.send_state.lock();
            let SendState { buffer, sequence } = &mut *state;

            buffer.clear();
            RtpHeader {
                payload_type: self.config.payload_type,
                sequence: *sequence,
                timestamp,
                ssrc: self.ssrc,
            }
            .write_to(buffer);
            buffer.extend_from_slice(payload);
            *sequence = sequence.wrapping_add(1);

            for peer in self.peers.snapshot() {
                match self.socket.send_to(buffer, peer) {
                    Ok(sent) if sent == buffer.len() => {
                        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                        self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                    }
                    Ok(sent) => failures.push((
                        peer,
                        io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("sent {} of {} bytes", sent, buffer.len()),
                        ),
                    )),
                    Err(e) => failures.push((peer, e)),
                }
            }
        }

        for (peer, source) in failures {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            warn!("RTP send to {} failed: {}", peer, source);
            self.handler.on_error(TransportError::Send { peer, source });
        }
        Ok(())
    }
}

impl Drop for RtpTransport {
    fn drop(&mut self) {
        if self.shutdown().is_err() {
            warn!("RTP receive thread panicked");
        }
    }
}

/// State owned by the receive thread
struct ReceiveLoop {
    socket: Arc<UdpSocket>,
    peers: Arc<PeerRegistry>,
    handler: Arc<dyn RtpHandler>,
    stats: Arc<RtpStats>,
    packet_size: usize,
    keepalive_interval: Duration,
    cancel: Receiver<()>,
}

impl ReceiveLoop {
    fn run(self, started: Sender<()>) {
        // One spare byte so oversized datagrams show up as a length mismatch
        let mut buf = vec![0u8; self.packet_size + 1];
        let mut last_activity = Instant::now();

        let _ = started.send(());

        loop {
            match self.cancel.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    last_activity = Instant::now();
                    self.process(&buf[..len], from);
                }
                Err(e) if io_err_is_timeout(e.kind()) => {
                    if last_activity.elapsed() >= self.keepalive_interval {
                        self.send_keepalives();
                        last_activity = Instant::now();
                    }
                }
                Err(e) => {
                    self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("RTP receive failed: {}", e);
                    self.handler.on_error(TransportError::Receive(e));
                }
            }
        }

        debug!("RTP receive loop exiting");
    }

    fn process(&self, data: &[u8], from: SocketAddr) {
        if data.len() != self.packet_size {
            trace!("Dropped {} byte datagram from {}", data.len(), from);
            return;
        }
        if !self.peers.contains(&from) {
            trace!("Dropped packet from unregistered {}", from);
            return;
        }
        let Some(header) = RtpHeader::parse(data) else {
            trace!("Dropped malformed packet from {}", from);
            return;
        };
        // The peer may have been removed since the lookup above
        let Some(sequence) = self.peers.update_sequence(&from, header.sequence) else {
            return;
        };

        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);

        self.handler.on_received(ReceivedPacket {
            peer: from,
            payload_type: header.payload_type,
            sequence,
            timestamp: header.timestamp,
            ssrc: header.ssrc,
            payload: Bytes::copy_from_slice(&data[HEADER_SIZE..]),
        });
    }

    fn send_keepalives(&self) {
        for peer in self.peers.snapshot() {
            match self.socket.send_to(&[], peer) {
                Ok(_) => {
                    self.stats.keepalives_sent.fetch_add(1, Ordering::Relaxed);
                    trace!("Keepalive to {}", peer);
                }
                Err(source) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    self.handler.on_error(TransportError::Send { peer, source });
                }
            }
        }
    }
}

/// `WouldBlock` and `TimedOut` both mean the read timeout elapsed
fn io_err_is_timeout(kind: io::ErrorKind) -> bool {
    use io::ErrorKind::*;
    [WouldBlock, TimedOut].contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    const PAYLOAD: usize = 4;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn transport(config: RtpConfig) -> (RtpTransport, Receiver<RtpEvent>) {
        let (tx, rx) = unbounded();
        let transport = RtpTransport::bind(loopback(), config, Arc::new(tx)).unwrap();
        (transport, rx)
    }

    fn raw_socket() -> UdpSocket {
        let socket = UdpSocket::bind(loopback()).unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket
    }

    fn packet(payload_type: u8, sequence: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        RtpHeader {
            payload_type,
            sequence,
            timestamp,
            ssrc: 0xabcd,
        }
        .write_to(&mut buf);
        buf.extend_from_slice(payload);
        buf
    }

    fn next_packet(rx: &Receiver<RtpEvent>) -> ReceivedPacket {
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            RtpEvent::Received(packet) => packet,
            RtpEvent::Error(e) => panic!("unexpected error event: {}", e),
        }
    }

    #[test]
    fn test_wire_layout_and_sequence() {
        let (transport, _rx) = transport(RtpConfig::new(96, PAYLOAD));
        let peer = raw_socket();
        transport.add_peer(peer.local_addr().unwrap());

        transport.send(0x0102_0304, &[9, 8, 7, 6]).unwrap();
        transport.send(0x0102_0305, &[5, 4, 3, 2]).unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(len, HEADER_SIZE + PAYLOAD);
        assert_eq!(from, transport.local_addr().unwrap());
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 96);
        assert_eq!(&buf[2..4], &[0, 0]);
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
        assert_eq!(&buf[8..12], &transport.ssrc().to_be_bytes());
        assert_eq!(&buf[12..16], &[9, 8, 7, 6]);

        let (len, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(len, 16);
        assert_eq!(&buf[2..4], &[0, 1]);
        assert_eq!(transport.next_sequence(), 2);
        assert_eq!(transport.stats().packets_sent, 2);
    }

    #[test]
    fn test_wrong_payload_size_rejected() {
        let (transport, _rx) = transport(RtpConfig::new(96, PAYLOAD));
        assert!(matches!(
            transport.send(0, &[1, 2, 3]),
            Err(TransportError::PayloadSize { expected: 4, actual: 3 })
        ));
        assert_eq!(transport.next_sequence(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (tx, _rx) = unbounded::<RtpEvent>();
        let result = RtpTransport::bind(loopback(), RtpConfig::new(200, PAYLOAD), Arc::new(tx));
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[test]
    fn test_sequence_wraps() {
        let (transport, _rx) = transport(RtpConfig::new(0, PAYLOAD));
        for _ in 0..65536u32 {
            transport.send(0, &[0; PAYLOAD]).unwrap();
        }
        assert_eq!(transport.next_sequence(), 0);
    }

    #[test]
    fn test_receive_from_registered_peer_only() {
        let (transport, rx) = transport(RtpConfig::new(96, PAYLOAD));
        let addr = transport.local_addr().unwrap();
        let peer = raw_socket();
        let stranger = raw_socket();
        transport.add_peer(peer.local_addr().unwrap());
        transport.open().unwrap();

        stranger.send_to(&packet(96, 7, 1, &[1; PAYLOAD]), addr).unwrap();
        peer.send_to(&packet(96, 7, 1, &[2; PAYLOAD]), addr).unwrap();

        let received = next_packet(&rx);
        assert_eq!(received.peer, peer.local_addr().unwrap());
        assert_eq!(received.sequence, 7);
        assert_eq!(received.timestamp, 1);
        assert_eq!(received.ssrc, 0xabcd);
        assert_eq!(&received.payload[..], &[2; PAYLOAD]);

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        transport.close();
    }

    #[test]
    fn test_malformed_packets_dropped() {
        let (transport, rx) = transport(RtpConfig::new(96, PAYLOAD));
        let addr = transport.local_addr().unwrap();
        let peer = raw_socket();
        transport.add_peer(peer.local_addr().unwrap());
        transport.open().unwrap();

        // Short, long, zero-length, bad marker, high payload-type bit
        peer.send_to(&packet(96, 1, 0, &[0; 3]), addr).unwrap();
        peer.send_to(&packet(96, 1, 0, &[0; 5]), addr).unwrap();
        peer.send_to(&[], addr).unwrap();
        let mut bad_marker = packet(96, 1, 0, &[0; PAYLOAD]);
        bad_marker[0] = 0x90;
        peer.send_to(&bad_marker, addr).unwrap();
        let mut bad_type = packet(96, 1, 0, &[0; PAYLOAD]);
        bad_type[1] = 0xe0;
        peer.send_to(&bad_type, addr).unwrap();

        peer.send_to(&packet(96, 2, 0, &[0; PAYLOAD]), addr).unwrap();

        let received = next_packet(&rx);
        assert_eq!(received.sequence, 2);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(transport.stats().packets_received, 1);
    }

    #[test]
    fn test_sequence_extension_across_wrap() {
        let (transport, rx) = transport(RtpConfig::new(96, PAYLOAD));
        let addr = transport.local_addr().unwrap();
        let peer = raw_socket();
        transport.add_peer(peer.local_addr().unwrap());
        transport.open().unwrap();

        for wire in [65534u16, 65535, 0, 65535, 1] {
            peer.send_to(&packet(96, wire, 0, &[0; PAYLOAD]), addr).unwrap();
        }

        let sequences: Vec<u32> = (0..5).map(|_| next_packet(&rx).sequence).collect();
        // The late 65535 is reported as-is but does not move the counter back
        assert_eq!(sequences, vec![65534, 65535, 65536, 65535, 65537]);
    }

    #[test]
    fn test_keepalive_after_idle_interval() {
        let config = RtpConfig::new(96, PAYLOAD)
            .with_keepalive_interval(Duration::from_millis(400))
            .with_poll_interval(Duration::from_millis(20));
        let (transport, _rx) = transport(config);
        let peer = raw_socket();
        transport.add_peer(peer.local_addr().unwrap());
        transport.open().unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(len, 0);
        assert_eq!(from, transport.local_addr().unwrap());

        // Exactly one per interval
        peer.set_read_timeout(Some(Duration::from_millis(150))).unwrap();
        let err = peer.recv_from(&mut buf).unwrap_err();
        assert!(io_err_is_timeout(err.kind()));

        assert_eq!(transport.next_sequence(), 0);
        assert_eq!(transport.stats().keepalives_sent, 1);
        transport.close();
    }

    #[test]
    fn test_failed_peer_does_not_block_others() {
        let (transport, rx) = transport(RtpConfig::new(96, PAYLOAD));
        let good = raw_socket();
        // An IPv6 destination cannot be reached from an IPv4 socket
        let bad: SocketAddr = "[::1]:9".parse().unwrap();
        transport.add_peer(bad);
        transport.add_peer(good.local_addr().unwrap());

        transport.send(0, &[1; PAYLOAD]).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = good.recv_from(&mut buf).unwrap();
        assert_eq!(len, HEADER_SIZE + PAYLOAD);

        match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
            RtpEvent::Error(TransportError::Send { peer, .. }) => assert_eq!(peer, bad),
            other => panic!("expected send error, got {:?}", other),
        }
        let stats = transport.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.send_errors, 1);
    }

    #[test]
    fn test_open_close_lifecycle() {
        let (transport, _rx) = transport(RtpConfig::new(96, PAYLOAD));
        transport.open().unwrap();
        assert!(transport.is_open());
        assert!(matches!(transport.open(), Err(TransportError::AlreadyOpen)));

        transport.close();
        transport.close();
        assert!(!transport.is_open());

        transport.open().unwrap();
        transport.close();
    }

    #[test]
    fn test_two_transports_talk() {
        let (alice, _alice_rx) = transport(RtpConfig::new(11, PAYLOAD));
        let (bob, bob_rx) = transport(RtpConfig::new(11, PAYLOAD));
        alice.add_peer(bob.local_addr().unwrap());
        bob.add_peer(alice.local_addr().unwrap());
        bob.open().unwrap();

        for ts in 0..3u32 {
            alice.send(ts * 160, &[ts as u8; PAYLOAD]).unwrap();
        }

        for expected in 0..3u32 {
            let packet = next_packet(&bob_rx);
            assert_eq!(packet.sequence, expected);
            assert_eq!(packet.timestamp, expected * 160);
            assert_eq!(packet.payload_type, 11);
            assert_eq!(packet.ssrc, alice.ssrc());
        }

        assert!(bob.remove_peer(&alice.local_addr().unwrap()));
        assert!(!bob.remove_peer(&alice.local_addr().unwrap()));
    }
}
