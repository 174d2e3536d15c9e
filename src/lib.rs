//! # Voice RTP
//!
//! Real-time voice between peers over RTP/UDP, with an event-driven audio
//! device engine underneath.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           VoiceSession                                │
//! │                                                                       │
//! │  ┌────────────┐   ┌─────────────┐   ┌──────────────────────────────┐  │
//! │  │  Capture   │──►│ Transmitter │──►│        RtpTransport          │  │
//! │  │  Engine    │   │ gain, gate, │   │  one UDP socket, fan-out to  │  │
//! │  │ (audio-    │   │ encode      │   │  every peer, keepalives      │  │
//! │  │  capture)  │   └─────────────┘   └──────────────┬───────────────┘  │
//! │  └────────────┘                                    │ rtp-receive      │
//! │                                                    ▼                  │
//! │                                     ┌──────────────────────────────┐  │
//! │                                     │ VoiceReceiver                │  │
//! │                                     │ per-peer decoder, loss       │  │
//! │                                     │ concealment, playout FIFO    │  │
//! │                                     └──────────────┬───────────────┘  │
//! │                                                    ▼                  │
//! │                          ┌──────────────┐  ┌──────────────┐           │
//! │                          │ Render peer 1│  │ Render peer N│  ...      │
//! │                          │ (audio-      │  │              │           │
//! │                          │  render)     │  │              │           │
//! │                          └──────────────┘  └──────────────┘           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Wire format: a 12-byte RTP header (version 2, 7-bit payload type, 16-bit
//! sequence, timestamp, SSRC) followed by a fixed-size codec payload.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod voice;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for voice
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 32_000;

    /// Default audio per packet in milliseconds
    pub const DEFAULT_FRAME_MS: f32 = 20.0;

    /// Default UDP port for RTP
    pub const DEFAULT_RTP_PORT: u16 = 5004;

    /// Default device buffer length in milliseconds
    pub const DEFAULT_DEVICE_BUFFER_MS: u32 = 20;

    /// Idle time before keepalives are sent
    pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;

    /// Receive thread wake-up interval
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    /// Default transmit threshold (frame peak, 0.0 - 1.0)
    pub const DEFAULT_TALK_LEVEL: f32 = 0.2;

    /// Most audio queued for one peer before new audio is dropped
    pub const MAX_PLAYOUT_MS: u64 = 200;

    /// Lost packets replaced per gap; longer gaps are skipped
    pub const MAX_CONCEALED_PACKETS: u32 = 5;
}
