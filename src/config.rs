//! Application configuration
//!
//! Read from TOML. Every section and field has a default, so a partial file
//! (or none at all) is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::audio::AudioFormat;
use crate::codec::{CodecInfo, CodecKind};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::voice::VoiceOptions;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioSettings,
    pub network: NetworkConfig,
    pub voice: VoiceConfig,
}

/// Device selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Input device name; the system default when unset
    pub capture_device: Option<String>,
    /// Output device name; the system default when unset
    pub render_device: Option<String>,
    /// Device buffer length in milliseconds
    pub buffer_ms: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            capture_device: None,
            render_device: None,
            buffer_ms: DEFAULT_DEVICE_BUFFER_MS,
        }
    }
}

/// Socket and transport timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: IpAddr,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub keepalive_secs: u64,
    pub poll_interval_ms: u64,
    /// Socket receive buffer in bytes; the OS default when unset
    pub recv_buffer_size: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_RTP_PORT,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            recv_buffer_size: None,
        }
    }
}

impl NetworkConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Codec and voice processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub codec: CodecKind,
    pub sample_rate: u32,
    pub channels: u16,
    /// Audio per packet in milliseconds
    pub frame_ms: f32,
    /// Opus bitrate in bits per second
    pub bitrate: u32,
    /// Overrides the codec's payload type
    pub payload_type: Option<u8>,
    pub capture_gain_db: f32,
    /// Linear playback volume
    pub render_volume: f32,
    /// Minimum peak (0.0 - 1.0) to transmit; 0.0 transmits everything
    pub talk_level: f32,
    /// Peers as `host:port`
    pub peers: Vec<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::Opus,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_ms: DEFAULT_FRAME_MS,
            bitrate: DEFAULT_BITRATE,
            payload_type: None,
            capture_gain_db: 0.0,
            render_volume: 1.0,
            talk_level: DEFAULT_TALK_LEVEL,
            peers: Vec::new(),
        }
    }
}

impl VoiceConfig {
    pub fn frame_duration(&self) -> Duration {
        // Rounded to whole microseconds; negative and NaN become zero
        Duration::from_micros((self.frame_ms * 1000.0).round() as u64)
    }

    /// Codec parameters, with the payload type override applied
    pub fn codec_info(&self) -> Result<CodecInfo> {
        let format = AudioFormat::pcm16(self.channels, self.sample_rate)?;
        let info = CodecInfo::new(self.codec, format, self.frame_duration(), self.bitrate)?;
        Ok(match self.payload_type {
            Some(payload_type) => info.with_payload_type(payload_type),
            None => info,
        })
    }

    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.peers
            .iter()
            .map(|peer| {
                peer.parse()
                    .map_err(|_| Error::Config(format!("invalid peer address '{}'", peer)))
            })
            .collect()
    }
}

impl AppConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No configuration file, using defaults");
                    Self::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let voice = &self.voice;
        if let Some(payload_type) = voice.payload_type {
            if payload_type > 0x7f {
                return Err(Error::Config(format!(
                    "payload type {} does not fit in 7 bits",
                    payload_type
                )));
            }
        }
        if self.network.keepalive_secs == 0 || self.network.poll_interval_ms == 0 {
            return Err(Error::Config("keepalive and poll intervals must be non-zero".into()));
        }
        if voice.channels == 0 || voice.sample_rate == 0 {
            return Err(Error::Config("channels and sample rate must be non-zero".into()));
        }
        if voice.frame_duration().is_zero() {
            return Err(Error::Config("frame duration must be positive".into()));
        }
        if self.audio.buffer_ms == 0 {
            return Err(Error::Config("device buffer must be positive".into()));
        }
        voice.peer_addrs()?;
        Ok(())
    }

    pub fn voice_options(&self) -> VoiceOptions {
        VoiceOptions {
            capture_gain_db: self.voice.capture_gain_db,
            talk_level: (self.voice.talk_level > 0.0).then_some(self.voice.talk_level),
            render_volume: self.voice.render_volume,
            keepalive_interval: Duration::from_secs(self.network.keepalive_secs),
            poll_interval: Duration::from_millis(self.network.poll_interval_ms),
        }
    }
}

/// `<config dir>/voice-rtp/config.toml` for the current user
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "voice-rtp").map(|dirs| dirs.config_dir().join("config.toml"))
}
