//! Runtime controls shared by the capture, receive and render paths

use parking_lot::RwLock;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::constants::{DEFAULT_KEEPALIVE_SECS, DEFAULT_POLL_INTERVAL_MS};
use crate::network::RtpStatsSnapshot;

/// Decides from the frame peak (0.0 - 1.0) whether to transmit it
pub type TransmitPredicate = Box<dyn Fn(f32) -> bool + Send + Sync>;

/// Decides whether audio from a peer is played
pub type ReceivePredicate = Box<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Session parameters that do not depend on the codec
#[derive(Debug, Clone, Copy)]
pub struct VoiceOptions {
    pub capture_gain_db: f32,
    /// Minimum frame peak to transmit; `None` transmits everything
    pub talk_level: Option<f32>,
    /// Linear playback volume
    pub render_volume: f32,
    pub keepalive_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            capture_gain_db: 0.0,
            talk_level: None,
            render_volume: 1.0,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// f32 stored as its bit pattern
#[derive(Debug)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Knobs and counters read on the audio and network threads
pub struct VoiceControls {
    capture_gain_db: AtomicF32,
    render_volume: AtomicF32,
    level: AtomicF32,
    talk_level: RwLock<Option<f32>>,
    transmit_predicate: RwLock<Option<TransmitPredicate>>,
    receive_predicate: RwLock<Option<ReceivePredicate>>,

    pub(crate) frames_processed: AtomicU64,
    pub(crate) packets_transmitted: AtomicU64,
    pub(crate) packets_suppressed: AtomicU64,
    pub(crate) packets_received: AtomicU64,
    pub(crate) packets_concealed: AtomicU64,
    pub(crate) packets_dropped: AtomicU64,
}

impl VoiceControls {
    pub fn new(options: &VoiceOptions) -> Self {
        Self {
            capture_gain_db: AtomicF32::new(options.capture_gain_db),
            render_volume: AtomicF32::new(options.render_volume.max(0.0)),
            level: AtomicF32::new(0.0),
            talk_level: RwLock::new(options.talk_level),
            transmit_predicate: RwLock::new(None),
            receive_predicate: RwLock::new(None),
            frames_processed: AtomicU64::new(0),
            packets_transmitted: AtomicU64::new(0),
            packets_suppressed: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_concealed: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        }
    }

    pub fn capture_gain_db(&self) -> f32 {
        self.capture_gain_db.load()
    }

    pub fn set_capture_gain_db(&self, gain_db: f32) {
        self.capture_gain_db.store(gain_db);
    }

    pub fn render_volume(&self) -> f32 {
        self.render_volume.load()
    }

    /// Negative volumes are treated as mute
    pub fn set_render_volume(&self, volume: f32) {
        self.render_volume.store(volume.max(0.0));
    }

    /// Peak of the most recent captured frame after gain
    pub fn level(&self) -> f32 {
        self.level.load()
    }

    pub(crate) fn set_level(&self, level: f32) {
        self.level.store(level);
    }

    pub fn talk_level(&self) -> Option<f32> {
        *self.talk_level.read()
    }

    pub fn set_talk_level(&self, level: Option<f32>) {
        *self.talk_level.write() = level;
    }

    pub fn set_transmit_predicate(&self, predicate: Option<TransmitPredicate>) {
        *self.transmit_predicate.write() = predicate;
    }

    pub fn set_receive_predicate(&self, predicate: Option<ReceivePredicate>) {
        *self.receive_predicate.write() = predicate;
    }

    /// The transmit predicate wins over the talk level when both are set
    pub fn should_transmit(&self, peak: f32) -> bool {
        if let Some(predicate) = self.transmit_predicate.read().as_ref() {
            return predicate(peak);
        }
        match self.talk_level() {
            Some(threshold) => peak >= threshold,
            None => true,
        }
    }

    pub fn accepts(&self, peer: &SocketAddr) -> bool {
        match self.receive_predicate.read().as_ref() {
            Some(predicate) => predicate(peer),
            None => true,
        }
    }

    pub(crate) fn snapshot(&self, frames_captured: u64, rtp: RtpStatsSnapshot) -> VoiceStats {
        VoiceStats {
            frames_captured,
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            packets_transmitted: self.packets_transmitted.load(Ordering::Relaxed),
            packets_suppressed: self.packets_suppressed.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_concealed: self.packets_concealed.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            level: self.level(),
            rtp,
        }
    }
}

/// Voice session statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VoiceStats {
    /// Frames delivered by the capture device
    pub frames_captured: u64,
    /// Codec frames gain-adjusted and metered
    pub frames_processed: u64,
    /// Frames encoded and handed to the transport
    pub packets_transmitted: u64,
    /// Frames held back by the talk level or transmit predicate
    pub packets_suppressed: u64,
    /// Packets decoded into a playout FIFO
    pub packets_received: u64,
    /// Lost packets replaced by concealment audio
    pub packets_concealed: u64,
    /// Packets rejected as filtered, stale or undecodable
    pub packets_dropped: u64,
    pub level: f32,
    pub rtp: RtpStatsSnapshot,
}
